use core::fmt;

/// The VM's evaluation stack.
///
/// A thin wrapper over `Vec` that speaks in stack terms; multi-value pops
/// return values in push order.
///
/// # Examples
///
/// ```ignore
/// use xslate_core::vm::Stack;
///
/// let mut stack = Stack::new(16);
/// stack.push(42);
/// stack.push(17);
/// assert_eq!(stack.pop(), Some(17));
/// assert_eq!(stack.peek(), Some(&42));
/// assert_eq!(stack.len(), 1);
/// ```
pub struct Stack<T> {
    /// The underlying storage for stack elements.
    items: Vec<T>,
}

impl<T> Stack<T> {
    /// Creates a new stack, pre-allocating room for `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn push(&mut self, value: T) {
        self.items.push(value);
    }

    /// Removes and returns the top value from the stack.
    ///
    /// Returns `None` if the stack is empty.
    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    /// Returns a reference to the top value without removing it.
    #[inline]
    pub fn peek(&self) -> Option<&T> {
        self.items.last()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Removes the top `n` elements and returns them bottom to top (so
    /// `result[0]` is the oldest of the n elements).
    ///
    /// Returns `None`, leaving the stack untouched, if there are fewer than
    /// `n` elements.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use xslate_core::vm::Stack;
    ///
    /// let mut stack = Stack::new(16);
    /// stack.push(10);
    /// stack.push(20);
    /// stack.push(30);
    ///
    /// assert_eq!(stack.pop_n(2), Some(vec![20, 30]));
    /// assert_eq!(stack.pop_n(2), None);
    /// assert_eq!(stack.len(), 1);
    /// ```
    #[inline]
    pub fn pop_n(&mut self, n: usize) -> Option<Vec<T>> {
        let len = self.items.len();
        if n > len {
            None
        } else {
            Some(self.items.split_off(len - n))
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("items", &self.items)
            .field("len", &self.items.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stack() {
        let stack: Stack<i32> = Stack::new(100);
        assert_eq!(stack.len(), 0);
        assert_eq!(stack.peek(), None);
    }

    #[test]
    fn test_push_pop() {
        let mut stack = Stack::new(100);
        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_peek() {
        let mut stack = Stack::new(100);
        assert_eq!(stack.peek(), None);

        stack.push(42);
        assert_eq!(stack.peek(), Some(&42));
        assert_eq!(stack.len(), 1); // Peek doesn't remove
    }

    #[test]
    fn test_pop_n_keeps_push_order() {
        let mut stack = Stack::new(100);
        for i in 1..=4 {
            stack.push(i);
        }

        assert_eq!(stack.pop_n(0), Some(vec![]));
        assert_eq!(stack.pop_n(3), Some(vec![2, 3, 4]));
        assert_eq!(stack.pop_n(2), None);
        assert_eq!(stack.len(), 1);
    }
}

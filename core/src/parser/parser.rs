use ecow::EcoString;
use lazy_static::lazy_static;
use pest::Parser;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest_derive::Parser;

use crate::parser::{
    BinaryOp, BoolOp, Expr, Literal, Node, ParseError, ParseErrorKind, Span, Template, UnaryOp,
};

lazy_static! {
    // Note: precedence is defined lowest to highest.
    static ref PRATT_PARSER: PrattParser<Rule> = PrattParser::new()
        // (lowest precedence)
        // Logical operators.
        .op(Op::infix(Rule::or, Assoc::Left))            // `||`, `or`
        .op(Op::infix(Rule::and, Assoc::Left))           // `&&`, `and`
        .op(Op::prefix(Rule::not))                       // `!`, `not`

        // Comparisons.
        .op(
            Op::infix(Rule::eq, Assoc::Left) |
            Op::infix(Rule::ne, Assoc::Left) |
            Op::infix(Rule::lt, Assoc::Left) |
            Op::infix(Rule::le, Assoc::Left) |
            Op::infix(Rule::gt, Assoc::Left) |
            Op::infix(Rule::ge, Assoc::Left)
        )                                               // `==`, `!=`, `<`, ...

        // Concatenation and arithmetic.
        .op(Op::infix(Rule::concat, Assoc::Left))        // `~`
        .op(
            Op::infix(Rule::add, Assoc::Left) |
            Op::infix(Rule::sub, Assoc::Left)
        )                                               // `+`, `-`
        .op(
            Op::infix(Rule::mul, Assoc::Left) |
            Op::infix(Rule::div, Assoc::Left) |
            Op::infix(Rule::modulo, Assoc::Left)
        )                                               // `*`, `/`, `%`
        .op(Op::prefix(Rule::neg))                       // `-`

        // Postfix operators.
        .op(
            Op::postfix(Rule::call_op) |
            Op::postfix(Rule::index_op) |
            Op::postfix(Rule::field_op) |
            Op::postfix(Rule::filter_op)
        )                                               // `()`, `[]`, `.`, `|`
        // (highest precedence)
        ;
}

#[derive(Parser)]
#[grammar = "parser/template.pest"]
pub struct TTerseGrammar;

/// Parse a template in the TTerse-like syntax.
///
/// `name` identifies the template in error messages.
pub fn parse(name: &str, source: &str) -> Result<Template, ParseError> {
    let builder = Builder { name, source };
    let mut pairs = TTerseGrammar::parse(Rule::main, source)
        .map_err(|e| ParseError::from_pest(name, source, e))?;
    let main = pairs
        .next()
        .ok_or_else(|| builder.error(Span::new(0, 0), ParseErrorKind::other("empty parse")))?;
    builder.template(main)
}

/// A block whose `END` has not been seen yet.
struct OpenBlock {
    kind: BlockKind,
    span: Span,
    body: Vec<Node>,
}

enum BlockKind {
    Root,
    If {
        branches: Vec<(Expr, Vec<Node>)>,
        /// Condition guarding `body`; `None` once `ELSE` has been seen.
        pending: Option<Expr>,
    },
    Foreach {
        var: EcoString,
        iterable: Expr,
    },
    While {
        cond: Expr,
    },
    Macro {
        name: EcoString,
        params: Vec<(EcoString, Span)>,
    },
}

impl BlockKind {
    fn describe(&self) -> &'static str {
        match self {
            BlockKind::Root => "template",
            BlockKind::If { .. } => "IF",
            BlockKind::Foreach { .. } => "FOREACH",
            BlockKind::While { .. } => "WHILE",
            BlockKind::Macro { .. } => "MACRO",
        }
    }
}

struct Builder<'s> {
    name: &'s str,
    source: &'s str,
}

impl<'s> Builder<'s> {
    fn error(&self, span: Span, kind: ParseErrorKind) -> ParseError {
        ParseError::new(self.name, self.source, span, kind)
    }

    fn template(&self, main: Pair<'s, Rule>) -> Result<Template, ParseError> {
        let mut stack = vec![OpenBlock {
            kind: BlockKind::Root,
            span: Span::new(0, 0),
            body: Vec::new(),
        }];

        for pair in main.into_inner() {
            match pair.as_rule() {
                Rule::text => top(&mut stack).body.push(Node::Text(pair.as_str().into())),
                Rule::comment | Rule::EOI => {}
                Rule::tag => self.tag(&mut stack, pair)?,
                rule => {
                    return Err(self.error(
                        pair.as_span().into(),
                        ParseErrorKind::other(format!("unexpected {:?}", rule)),
                    ));
                }
            }
        }

        if stack.len() > 1 {
            let open = top(&mut stack);
            return Err(self.error(
                open.span.clone(),
                ParseErrorKind::Unclosed {
                    block: open.kind.describe(),
                },
            ));
        }

        let root = stack.pop().map(|block| block.body).unwrap_or_default();
        Ok(Template {
            name: self.name.into(),
            body: root,
        })
    }

    fn tag(&self, stack: &mut Vec<OpenBlock>, tag: Pair<'s, Rule>) -> Result<(), ParseError> {
        let span: Span = tag.as_span().into();
        let directive = self.child(&mut tag.into_inner(), &span)?;
        let rule = directive.as_rule();
        let mut parts = directive.into_inner().filter(|p| !is_keyword(p.as_rule()));

        match rule {
            Rule::print_tag => {
                let expr = self.expr(self.next(&mut parts, &span)?)?;
                top(stack).body.push(Node::Print(expr));
            }
            Rule::set_tag => {
                let name = self.next(&mut parts, &span)?.as_str().into();
                let value = self.expr(self.next(&mut parts, &span)?)?;
                top(stack).body.push(Node::Set { name, value });
            }
            Rule::include_tag => {
                let template = self.expr(self.next(&mut parts, &span)?)?;
                let args = parts
                    .map(|arg| {
                        let arg_span = arg.as_span().into();
                        let mut inner = arg.into_inner();
                        let name: EcoString = self.child(&mut inner, &arg_span)?.as_str().into();
                        let value = self.expr(self.child(&mut inner, &arg_span)?)?;
                        Ok((name, value))
                    })
                    .collect::<Result<_, ParseError>>()?;
                top(stack).body.push(Node::Include { template, args });
            }
            Rule::if_tag | Rule::unless_tag => {
                let mut cond = self.expr(self.next(&mut parts, &span)?)?;
                if rule == Rule::unless_tag {
                    cond = Expr::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(cond),
                    };
                }
                stack.push(OpenBlock {
                    kind: BlockKind::If {
                        branches: Vec::new(),
                        pending: Some(cond),
                    },
                    span,
                    body: Vec::new(),
                });
            }
            Rule::elsif_tag => {
                let cond = self.expr(self.next(&mut parts, &span)?)?;
                let block = top(stack);
                match &mut block.kind {
                    BlockKind::If { branches, pending } => {
                        let Some(previous) = pending.take() else {
                            return Err(self.misplaced(span, "ELSIF", "ELSIF after ELSE"));
                        };
                        branches.push((previous, core::mem::take(&mut block.body)));
                        *pending = Some(cond);
                    }
                    _ => return Err(self.misplaced(span, "ELSIF", "ELSIF without IF")),
                }
            }
            Rule::else_tag => {
                let block = top(stack);
                match &mut block.kind {
                    BlockKind::If { branches, pending } => {
                        let Some(previous) = pending.take() else {
                            return Err(self.misplaced(span, "ELSE", "duplicate ELSE"));
                        };
                        branches.push((previous, core::mem::take(&mut block.body)));
                    }
                    _ => return Err(self.misplaced(span, "ELSE", "ELSE without IF")),
                }
            }
            Rule::foreach_tag => {
                let var = self.next(&mut parts, &span)?.as_str().into();
                let iterable = self.expr(self.next(&mut parts, &span)?)?;
                stack.push(OpenBlock {
                    kind: BlockKind::Foreach { var, iterable },
                    span,
                    body: Vec::new(),
                });
            }
            Rule::while_tag => {
                let cond = self.expr(self.next(&mut parts, &span)?)?;
                stack.push(OpenBlock {
                    kind: BlockKind::While { cond },
                    span,
                    body: Vec::new(),
                });
            }
            Rule::macro_tag => {
                let name = self.next(&mut parts, &span)?.as_str().into();
                let params = match parts.next() {
                    Some(params) => params
                        .into_inner()
                        .map(|p| (EcoString::from(p.as_str()), Span::from(p.as_span())))
                        .collect(),
                    None => Vec::new(),
                };
                stack.push(OpenBlock {
                    kind: BlockKind::Macro { name, params },
                    span,
                    body: Vec::new(),
                });
            }
            Rule::end_tag => {
                if stack.len() == 1 {
                    return Err(self.misplaced(span, "END", "END without an open block"));
                }
                let Some(block) = stack.pop() else {
                    return Err(self.misplaced(span, "END", "END without an open block"));
                };
                let node = match block.kind {
                    BlockKind::If {
                        mut branches,
                        pending,
                    } => match pending {
                        Some(cond) => {
                            branches.push((cond, block.body));
                            Node::If {
                                branches,
                                otherwise: None,
                            }
                        }
                        None => Node::If {
                            branches,
                            otherwise: Some(block.body),
                        },
                    },
                    BlockKind::Foreach { var, iterable } => Node::Foreach {
                        var,
                        iterable,
                        body: block.body,
                    },
                    BlockKind::While { cond } => Node::While {
                        cond,
                        body: block.body,
                    },
                    BlockKind::Macro { name, params } => Node::Macro {
                        name,
                        params,
                        body: block.body,
                    },
                    BlockKind::Root => {
                        return Err(self.misplaced(span, "END", "END without an open block"));
                    }
                };
                top(stack).body.push(node);
            }
            other => {
                return Err(self.error(
                    span,
                    ParseErrorKind::other(format!("unexpected directive {:?}", other)),
                ));
            }
        }
        Ok(())
    }

    fn misplaced(&self, span: Span, tag: &'static str, message: &str) -> ParseError {
        self.error(
            span,
            ParseErrorKind::Misplaced {
                tag,
                message: message.into(),
            },
        )
    }

    fn child(
        &self,
        pairs: &mut Pairs<'s, Rule>,
        span: &Span,
    ) -> Result<Pair<'s, Rule>, ParseError> {
        self.next(pairs, span)
    }

    fn next(
        &self,
        pairs: &mut impl Iterator<Item = Pair<'s, Rule>>,
        span: &Span,
    ) -> Result<Pair<'s, Rule>, ParseError> {
        pairs
            .next()
            .ok_or_else(|| self.error(span.clone(), ParseErrorKind::other("incomplete tag")))
    }

    fn expr(&self, pair: Pair<'s, Rule>) -> Result<Expr, ParseError> {
        match pair.as_rule() {
            Rule::expression => PRATT_PARSER
                .map_primary(|primary| self.expr(primary))
                .map_prefix(|op, rhs| {
                    let op = match op.as_rule() {
                        Rule::neg => UnaryOp::Neg,
                        _ => UnaryOp::Not,
                    };
                    Ok(Expr::Unary {
                        op,
                        expr: Box::new(rhs?),
                    })
                })
                .map_infix(|lhs, op, rhs| {
                    let op = match op.as_rule() {
                        Rule::and => return Ok(bool_expr(BoolOp::And, lhs?, rhs?)),
                        Rule::or => return Ok(bool_expr(BoolOp::Or, lhs?, rhs?)),
                        Rule::add => BinaryOp::Add,
                        Rule::sub => BinaryOp::Sub,
                        Rule::mul => BinaryOp::Mul,
                        Rule::div => BinaryOp::Div,
                        Rule::modulo => BinaryOp::Mod,
                        Rule::concat => BinaryOp::Concat,
                        Rule::eq => BinaryOp::Eq,
                        Rule::ne => BinaryOp::Ne,
                        Rule::lt => BinaryOp::Lt,
                        Rule::le => BinaryOp::Le,
                        Rule::gt => BinaryOp::Gt,
                        Rule::ge => BinaryOp::Ge,
                        other => {
                            return Err(self.error(
                                op.as_span().into(),
                                ParseErrorKind::other(format!("unknown operator {:?}", other)),
                            ));
                        }
                    };
                    Ok(Expr::Binary {
                        op,
                        left: Box::new(lhs?),
                        right: Box::new(rhs?),
                    })
                })
                .map_postfix(|lhs, op| {
                    let span: Span = op.as_span().into();
                    match op.as_rule() {
                        Rule::call_op => {
                            let args = op
                                .into_inner()
                                .map(|arg| self.expr(arg))
                                .collect::<Result<_, _>>()?;
                            Ok(Expr::Call {
                                function: Box::new(lhs?),
                                args,
                            })
                        }
                        Rule::index_op => {
                            let index = self.expr(self.child(&mut op.into_inner(), &span)?)?;
                            Ok(Expr::Index {
                                collection: Box::new(lhs?),
                                index: Box::new(index),
                            })
                        }
                        Rule::field_op => {
                            let field = self.child(&mut op.into_inner(), &span)?.as_str().into();
                            Ok(Expr::Attr {
                                object: Box::new(lhs?),
                                field,
                            })
                        }
                        _ => {
                            let name = self.child(&mut op.into_inner(), &span)?.as_str().into();
                            Ok(Expr::Filter {
                                expr: Box::new(lhs?),
                                name,
                                span,
                            })
                        }
                    }
                })
                .parse(pair.into_inner()),

            Rule::list => {
                let items = pair
                    .into_inner()
                    .map(|item| self.expr(item))
                    .collect::<Result<_, _>>()?;
                Ok(Expr::List(items))
            }

            Rule::int => {
                let value = pair.as_str().parse().map_err(|_| {
                    self.error(
                        pair.as_span().into(),
                        ParseErrorKind::InvalidNumber {
                            text: pair.as_str().into(),
                        },
                    )
                })?;
                Ok(Expr::Literal(Literal::Int(value)))
            }

            Rule::float => {
                let value = pair.as_str().parse().map_err(|_| {
                    self.error(
                        pair.as_span().into(),
                        ParseErrorKind::InvalidNumber {
                            text: pair.as_str().into(),
                        },
                    )
                })?;
                Ok(Expr::Literal(Literal::Float(value)))
            }

            Rule::string => {
                let span = pair.as_span().into();
                let inner = self.child(&mut pair.into_inner(), &span)?;
                Ok(Expr::Literal(Literal::Str(unescape(inner.as_str()))))
            }

            Rule::true_lit => Ok(Expr::Literal(Literal::Bool(true))),
            Rule::false_lit => Ok(Expr::Literal(Literal::Bool(false))),
            Rule::undef_lit => Ok(Expr::Literal(Literal::Undef)),
            Rule::ident => Ok(Expr::Var(pair.as_str().into())),

            other => Err(self.error(
                pair.as_span().into(),
                ParseErrorKind::other(format!("unhandled rule {:?}", other)),
            )),
        }
    }
}

fn top(stack: &mut [OpenBlock]) -> &mut OpenBlock {
    // The root block is pushed first and never popped before the end.
    let last = stack.len() - 1;
    &mut stack[last]
}

fn bool_expr(op: BoolOp, left: Expr, right: Expr) -> Expr {
    Expr::Bool {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::kw_if
            | Rule::kw_elsif
            | Rule::kw_else
            | Rule::kw_unless
            | Rule::kw_end
            | Rule::kw_foreach
            | Rule::kw_for
            | Rule::kw_in
            | Rule::kw_while
            | Rule::kw_set
            | Rule::kw_macro
            | Rule::kw_block
            | Rule::kw_include
            | Rule::kw_with
    )
}

fn unescape(s: &str) -> EcoString {
    let mut out = EcoString::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

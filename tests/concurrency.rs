//! One engine shared by many threads.

use std::{sync::Arc, thread};

use pretty_assertions::assert_eq;
use xslate::{Engine, EngineOptions, MemoryTemplateFetcher, Value, Vars};

#[test]
fn test_concurrent_renders_do_not_interfere() {
    let fetcher: MemoryTemplateFetcher = [
        (
            "user.tx",
            "[% SET greeting = 'hi ' ~ name %][% FOREACH n IN nums %][% INCLUDE 'num.tx' %][% END %]:[% greeting %]",
        ),
        ("num.tx", "[% n * factor %],"),
    ]
    .into_iter()
    .collect();
    let engine =
        Arc::new(Engine::with_fetcher(EngineOptions::default(), Arc::new(fetcher)).unwrap());

    let handles: Vec<_> = (0..16i64)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut vars = Vars::new();
                vars.insert("name".into(), Value::str(format!("t{}", t)));
                vars.insert("factor".into(), Value::Int(t));
                vars.insert("nums".into(), Value::list((1..=20).map(Value::Int)));
                let mut outputs = Vec::new();
                for _ in 0..10 {
                    outputs.push(engine.render("user.tx", &vars).unwrap());
                }
                (t, outputs)
            })
        })
        .collect();

    for handle in handles {
        let (t, outputs) = handle.join().unwrap();
        let expected: String = (1..=20)
            .map(|n| format!("{},", n * t))
            .chain([format!(":hi t{}", t)])
            .collect();
        for output in outputs {
            assert_eq!(output, expected);
        }
    }

    // Every render after the first per template hits the cache.
    assert!(engine.loader().stats().compilations() <= 2 * 16);
}

//! Gas-metered interpreter for a JavaScript subset.
//!
//! ```text
//! source ──► lexer ──► parser ──► Program
//!                                    │
//!          INPUT, SECRETS (frozen) ──┤
//!                                    ▼
//!                              Interpreter ──► main(INPUT) ──► JSON result
//!                                    │
//!                              GasMeter + deadline
//! ```
//!
//! Each run builds a fresh [`Interpreter`]; nothing survives between runs.

mod ast;
mod builtins;
mod interpreter;
mod lexer;
mod parser;
mod value;

pub use interpreter::{Limits, MAX_STRING_BYTES};
pub use parser::{parse, MAX_NESTING_DEPTH};

use crate::error::ExecutionResult;
use interpreter::Interpreter;
use serde_json::Value as Json;

/// Everything a single run produced, including partial accounting on failure.
#[derive(Debug)]
pub struct ScriptOutcome {
    pub result: ExecutionResult<Json>,
    pub gas_used: u64,
    pub logs: Vec<String>,
}

/// Parse and run `code`, returning the JSON result of `main(INPUT)`.
pub fn run_script(code: &str, input: &Json, secrets: &Json, gas_limit: u64, limits: Limits) -> ScriptOutcome {
    let mut interpreter = Interpreter::new(gas_limit, limits);
    let result = parse(code).and_then(|program| {
        interpreter.run_main(&program, code.len(), input, secrets)
    });
    ScriptOutcome {
        result,
        gas_used: interpreter.gas_used(),
        logs: interpreter.take_logs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use serde_json::json;
    use std::time::Duration;

    fn limits() -> Limits {
        Limits {
            max_call_depth: 32,
            max_log_lines: 10,
            timeout: Duration::from_secs(5),
        }
    }

    fn run(code: &str, input: Json) -> ScriptOutcome {
        run_script(code, &input, &json!({"API_KEY": "k-1"}), 1_000_000, limits())
    }

    fn value(code: &str, input: Json) -> Json {
        run(code, input).result.unwrap()
    }

    fn error(code: &str) -> ExecutionError {
        run(code, json!({})).result.unwrap_err()
    }

    #[test]
    fn test_arithmetic_and_strings() {
        assert_eq!(
            value("function main(i) { return i.a * 2 + 1; }", json!({"a": 20})),
            json!(41)
        );
        assert_eq!(value("function main() { return 7 / 2; }", json!({})), json!(3.5));
        assert_eq!(value("function main() { return 'n=' + 5; }", json!({})), json!("n=5"));
        assert_eq!(value("function main() { return -7 % 3; }", json!({})), json!(-1));
        assert_eq!(
            value("function main() { return 'Hello'.toUpperCase().slice(1, -1); }", json!({})),
            json!("ELL")
        );
    }

    #[test]
    fn test_control_flow() {
        let code = r#"
            function fib(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2); }
            function main(input) {
                let evens = [];
                for (let i = 0; i < 10; i++) {
                    if (i % 2 !== 0) continue;
                    if (i > 6) break;
                    evens.push(i);
                }
                let total = 0;
                for (const x of evens) total += x;
                let n = 3;
                while (n > 0) { n--; }
                return { evens, total, fib: fib(10), n };
            }
        "#;
        assert_eq!(
            value(code, json!({})),
            json!({"evens": [0, 2, 4, 6], "total": 12, "fib": 55, "n": 0})
        );
    }

    #[test]
    fn test_builtins() {
        let code = r#"
            function main(input) {
                const parsed = JSON.parse('{"a":[1,2,3]}');
                return {
                    max: Math.max(1, 9, 3),
                    floor: Math.floor(2.7),
                    keys: Object.keys({x: 1, y: 2}),
                    joined: parsed.a.map(function (v) { return v * 10; }).join("-"),
                    isArray: Array.isArray(parsed.a),
                    text: JSON.stringify({b: true}),
                    num: Number("42") + parseInt("8px"),
                    fixed: (2.345).toFixed(1),
                    kind: typeof missing,
                    nullish: input.none ?? "default",
                    split: "a,b".split(","),
                };
            }
        "#;
        assert_eq!(
            value(code, json!({})),
            json!({
                "max": 9, "floor": 2, "keys": ["x", "y"], "joined": "10-20-30",
                "isArray": true, "text": "{\"b\":true}", "num": 50, "fixed": "2.3",
                "kind": "undefined", "nullish": "default", "split": ["a", "b"]
            })
        );
    }

    #[test]
    fn test_secrets_and_input_are_read_only() {
        assert_eq!(value("function main() { return SECRETS.API_KEY; }", json!({})), json!("k-1"));

        let err = error("function main() { SECRETS.API_KEY = 'x'; return 1; }");
        assert!(matches!(err, ExecutionError::Runtime { .. }));

        let err = error("function main() { INPUT = {}; return 1; }");
        assert!(err.to_string().contains("constant"));

        let err = run("function main(i) { i.list.push(1); }", json!({"list": []}))
            .result
            .unwrap_err();
        assert!(err.to_string().contains("read only"));
    }

    #[test]
    fn test_console_log_is_captured_and_bounded() {
        let outcome = run(
            "function main() { for (let i = 0; i < 20; i++) console.log('line', i, {i}); return null; }",
            json!({}),
        );
        assert_eq!(outcome.result.unwrap(), Json::Null);
        assert_eq!(outcome.logs.len(), 10);
        assert_eq!(outcome.logs[1], "line 1 {\"i\":1}");
    }

    #[test]
    fn test_host_capabilities_are_absent() {
        for code in [
            "function main() { return fetch('http://example.com'); }",
            "function main() { return eval('1'); }",
            "function main() { return require('fs'); }",
        ] {
            let err = error(code);
            assert!(err.to_string().contains("is not defined"), "{}", err);
        }
    }

    #[test]
    fn test_missing_main() {
        let err = error("let x = 1;");
        assert!(err.to_string().contains("main"));
    }

    #[test]
    fn test_throw() {
        let err = error("function main() { throw { message: 'bad input' }; }");
        assert_eq!(err, ExecutionError::runtime("Uncaught bad input"));
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(error("function main( {"), ExecutionError::Syntax { .. }));
    }

    #[test]
    fn test_gas_exhaustion() {
        let outcome = run_script(
            "function main() { while (true) {} }",
            &json!({}),
            &json!({}),
            50_000,
            limits(),
        );
        assert!(matches!(outcome.result, Err(ExecutionError::GasExhausted(_))));
        assert!(outcome.gas_used <= 50_000);
    }

    #[test]
    fn test_base_cost_alone_can_exhaust() {
        let outcome = run_script("function main() {}", &json!({}), &json!({}), 999, limits());
        assert!(matches!(outcome.result, Err(ExecutionError::GasExhausted(_))));
        assert_eq!(outcome.gas_used, 0);
    }

    #[test]
    fn test_gas_is_deterministic() {
        let code = "function main(i) { let s = 0; for (let k = 0; k < i.n; k++) s += k; return s; }";
        let a = run(code, json!({"n": 50})).gas_used;
        let b = run(code, json!({"n": 50})).gas_used;
        let c = run(code, json!({"n": 100})).gas_used;
        assert_eq!(a, b);
        assert!(c > a);
    }

    #[test]
    fn test_timeout() {
        let outcome = run_script(
            "function main() { while (true) {} }",
            &json!({}),
            &json!({}),
            u64::MAX,
            Limits {
                timeout: Duration::from_millis(20),
                ..limits()
            },
        );
        assert_eq!(outcome.result, Err(ExecutionError::Timeout { limit_ms: 20 }));
    }

    #[test]
    fn test_call_depth_is_bounded() {
        let err = error("function f(n) { return f(n + 1); } function main() { return f(0); }");
        assert!(err.to_string().contains("call stack"));
    }

    #[test]
    fn test_string_growth_is_bounded() {
        let outcome = run_script(
            "function main() { let s = 'xxxxxxxxxxxxxxxx'; while (true) s = s + s; }",
            &json!({}),
            &json!({}),
            u64::MAX,
            limits(),
        );
        assert_eq!(outcome.result, Err(ExecutionError::runtime("Invalid string length")));
    }

    #[test]
    fn test_undefined_result_is_null() {
        assert_eq!(value("function main() {}", json!({})), Json::Null);
    }
}

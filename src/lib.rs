//! Data-driven JSON API test engine.
//!
//! Suites are JSON documents of test cases, each an ordered list of
//! steps (`http`, `wait`, `assert`, `use`, `for`, `while`) run against
//! a layered variable context. Values are referenced with
//! `{{ $.root.path }}` tokens; cases can repeat once per dataset.

pub mod assertion;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod flow;
pub mod http;
pub mod model;
pub mod path;
pub mod registry;
pub mod report;
pub mod runner;
pub mod step;
pub mod template;
pub mod token;

pub use assertion::{Assertion, AssertionOperation, AssertionResult, AssertionType, Operands};
pub use config::{EngineConfig, SuiteLoader};
pub use context::{ContextChanges, VariableContext};
pub use error::{Error, Result};
pub use executor::CaseExecutor;
pub use http::{HttpTransport, ReqwestTransport};
pub use model::*;
pub use registry::{register_assertion_type, register_step_type};
pub use report::{JsonReporter, MarkdownReporter, Reporter};
pub use runner::{SuiteRunner, TestRunner};
pub use step::{Runtime, Step, StepBehavior, StepOutcome, StepResult, StepType};
pub use template::{Template, TemplateCatalog, TemplateStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    /// Custom step registered at runtime.
    #[derive(Debug, Deserialize)]
    struct StampStep {
        value: serde_json::Value,
    }

    impl StepType for StampStep {}

    #[async_trait]
    impl StepBehavior for StampStep {
        async fn execute(
            &self,
            _rt: &Runtime,
            ctx: &mut VariableContext,
        ) -> anyhow::Result<StepOutcome> {
            ctx.set_root("stamp", token::resolve_value(&self.value, ctx))?;
            Ok(StepOutcome::passed())
        }
    }

    /// Custom operator registered at runtime.
    #[derive(Debug, Deserialize)]
    #[serde(transparent)]
    struct EvenAssertion(Operands);

    impl AssertionType for EvenAssertion {}

    impl AssertionOperation for EvenAssertion {
        fn operands(&self) -> &Operands {
            &self.0
        }

        fn evaluate(&self, actual: &serde_json::Value, _expected: &serde_json::Value) -> assertion::Verdict {
            match actual.as_i64() {
                Some(n) if n % 2 == 0 => Ok(()),
                _ => Err(format!("{actual} is not even")),
            }
        }
    }

    #[tokio::test]
    async fn test_runtime_registration() {
        register_step_type::<StampStep>().unwrap();
        register_assertion_type::<EvenAssertion>().unwrap();
        assert!(matches!(
            register_step_type::<StampStep>(),
            Err(Error::DuplicateType { .. })
        ));

        let step: Step = serde_json::from_value(json!({
            "type": "stamp",
            "value": "{{$.ctx.n}}",
            "assert": [{"type": "even", "actualValue": "{{$.stamp}}"}]
        }))
        .unwrap();

        let rt = Runtime::new(Arc::new(http::testing::StubTransport::default()));
        let mut ctx = VariableContext::new();
        ctx.set_root("ctx", json!({"n": 4})).unwrap();
        let result = step.execute(&rt, &mut ctx).await.unwrap();
        assert!(result.success, "{:?}", result.assertions);
        assert_eq!(result.kind, "stamp");
    }
}

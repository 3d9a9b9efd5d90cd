//! Processor running a fixed list of statements.

use super::{processor_params, PostProcessor, SchemaProcessor};
use crate::config::ProcessorConfig;
use crate::error::{MigrateError, Result};
use crate::report::ErrorLog;
use crate::target::TargetTransaction;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SqlParams {
    statements: Vec<String>,
}

/// Runs its statements in order. The first failing statement fails the
/// processor.
#[derive(Debug, Clone)]
pub struct SqlProcessor {
    statements: Vec<String>,
    requires_replay: bool,
}

impl SqlProcessor {
    pub fn new(statements: Vec<String>, requires_replay: bool) -> Self {
        Self {
            statements,
            requires_replay,
        }
    }

    fn from_config(config: &ProcessorConfig) -> Result<Self> {
        let params: SqlParams = processor_params(config)?;
        if params.statements.is_empty() {
            return Err(MigrateError::Config(
                "processor 'sql': statements must not be empty".into(),
            ));
        }
        Ok(Self::new(params.statements, config.requires_replay))
    }

    async fn execute_all(&self, tx: &mut dyn TargetTransaction) -> Result<()> {
        for statement in &self.statements {
            let affected = tx
                .execute(statement)
                .await
                .map_err(|e| MigrateError::processor("sql", e.to_string()))?;
            debug!("sql processor: {} row(s) affected by {}", affected, statement);
        }
        Ok(())
    }
}

pub(super) fn build_schema(config: &ProcessorConfig) -> Result<Box<dyn SchemaProcessor>> {
    Ok(Box::new(SqlProcessor::from_config(config)?))
}

pub(super) fn build_post(config: &ProcessorConfig) -> Result<Box<dyn PostProcessor>> {
    if config.requires_replay {
        return Err(MigrateError::Config(
            "requires_replay is only valid on schema processors".into(),
        ));
    }
    Ok(Box::new(SqlProcessor::from_config(config)?))
}

#[async_trait]
impl SchemaProcessor for SqlProcessor {
    fn name(&self) -> &str {
        "sql"
    }

    fn requires_replay(&self) -> bool {
        self.requires_replay
    }

    async fn apply(&self, tx: &mut dyn TargetTransaction, _errors: &mut ErrorLog) -> Result<()> {
        self.execute_all(tx).await
    }
}

#[async_trait]
impl PostProcessor for SqlProcessor {
    fn name(&self) -> &str {
        "sql"
    }

    async fn run(&self, tx: &mut dyn TargetTransaction, _errors: &mut ErrorLog) -> Result<()> {
        self.execute_all(tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{MemoryStore, TargetStore};

    #[tokio::test]
    async fn test_statements_run_in_order() {
        let store = MemoryStore::new();
        let processor = SqlProcessor::new(vec!["CREATE INDEX a".into(), "ANALYZE".into()], true);
        assert!(SchemaProcessor::requires_replay(&processor));

        let mut tx = store.begin().await.unwrap();
        let mut errors = ErrorLog::new();
        processor.apply(tx.as_mut(), &mut errors).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.state().await.executed, vec!["CREATE INDEX a", "ANALYZE"]);
    }

    #[tokio::test]
    async fn test_failing_statement_is_processor_error() {
        let store = MemoryStore::new().failing_on("DROP");
        let processor = SqlProcessor::new(vec!["DROP TABLE person".into()], false);
        let mut tx = store.begin().await.unwrap();
        let err = processor
            .run(tx.as_mut(), &mut ErrorLog::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_empty_statements_rejected() {
        let config = ProcessorConfig {
            kind: "sql".into(),
            requires_replay: false,
            params: [("statements".to_string(), serde_yaml::Value::Sequence(vec![]))]
                .into_iter()
                .collect(),
        };
        assert!(build_post(&config).is_err());
    }
}

//! The per-source transformation environment.

use crate::config::SyslogSourceConfig;
use crate::error::TransformError;
use crate::model::ParsedRecord;

use super::expr::CompiledExpr;
use super::template::Template;

/// Verdict of the filter stage for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Forward the record
    Pass,
    /// Discard silently (ack without producing)
    Dropped,
    /// Temporarily rejected; redeliver later (nack)
    Rejected,
    /// Evaluation failed; the message cannot be processed (perm_error)
    Error,
}

/// Result of filtering one record.
#[derive(Debug)]
pub struct FilterResult {
    /// The (possibly transformed) record, present only on [`FilterVerdict::Pass`]
    pub record: Option<ParsedRecord>,
    /// The verdict
    pub verdict: FilterVerdict,
    /// Diagnostic attached to an `Error` verdict
    pub warning: Option<String>,
}

/// Capability interface evaluated by the forwarder for every message.
///
/// Implementations have no ambient authority: no I/O, no clock beyond the
/// record's own timestamps. One environment is built lazily per `config_id`
/// and cached for the lifetime of a forwarding session.
pub trait TransformEnv: Send {
    /// Apply the filter, possibly rewriting the record.
    fn filter(&self, record: &ParsedRecord) -> FilterResult;

    /// Compute the destination topic. Failures are reported in the returned
    /// warnings and yield an empty string.
    fn topic(&self, record: &ParsedRecord) -> (String, Vec<String>);

    /// Compute the partition key. Same failure contract as [`Self::topic`].
    fn partition_key(&self, record: &ParsedRecord) -> (String, Vec<String>);
}

#[derive(Debug, Clone)]
enum StringSpec {
    Expr(CompiledExpr),
    Template(Template),
}

impl StringSpec {
    fn render(&self, record: &ParsedRecord) -> (String, Vec<String>) {
        match self {
            StringSpec::Expr(expr) => match expr.eval(record).and_then(|v| v.into_topic_string()) {
                Ok(s) => (s, Vec::new()),
                Err(e) => (String::new(), vec![e.to_string()]),
            },
            StringSpec::Template(tmpl) => tmpl.render(record),
        }
    }
}

/// Built-in [`TransformEnv`] backed by the expression language.
///
/// The filter expression is a keep-predicate: true passes the record through
/// unchanged, false drops it. Evaluation failures map to the `Error`
/// verdict. Topic and partition key each come from an expression when one is
/// configured, otherwise from a template; with neither configured the topic
/// falls back to the constant `"syslog"` and the partition key to the record
/// hostname.
pub struct ExprEnv {
    filter: Option<CompiledExpr>,
    topic: StringSpec,
    partition: StringSpec,
}

impl ExprEnv {
    /// Compile the environment for one source configuration.
    ///
    /// Structural errors here are configuration errors: `Config::validate`
    /// calls this for every source, so an invalid expression fails the load.
    pub fn compile(config: &SyslogSourceConfig) -> Result<Self, TransformError> {
        let filter = config
            .filter_expr
            .as_deref()
            .map(|src| CompiledExpr::compile(src, "filter"))
            .transpose()?;

        let topic = match (&config.topic_expr, &config.topic_template) {
            (Some(src), _) => StringSpec::Expr(CompiledExpr::compile(src, "topic")?),
            (None, Some(src)) => StringSpec::Template(Template::compile(src, "topic")?),
            (None, None) => StringSpec::Template(Template::compile("syslog", "topic")?),
        };

        let partition = match (&config.partition_expr, &config.partition_template) {
            (Some(src), _) => StringSpec::Expr(CompiledExpr::compile(src, "partition")?),
            (None, Some(src)) => StringSpec::Template(Template::compile(src, "partition")?),
            (None, None) => StringSpec::Template(Template::compile("{hostname}", "partition")?),
        };

        Ok(Self {
            filter,
            topic,
            partition,
        })
    }
}

impl TransformEnv for ExprEnv {
    fn filter(&self, record: &ParsedRecord) -> FilterResult {
        let Some(expr) = &self.filter else {
            return FilterResult {
                record: Some(record.clone()),
                verdict: FilterVerdict::Pass,
                warning: None,
            };
        };

        match expr.eval(record).and_then(|v| v.into_bool()) {
            Ok(true) => FilterResult {
                record: Some(record.clone()),
                verdict: FilterVerdict::Pass,
                warning: None,
            },
            Ok(false) => FilterResult {
                record: None,
                verdict: FilterVerdict::Dropped,
                warning: None,
            },
            Err(e) => FilterResult {
                record: None,
                verdict: FilterVerdict::Error,
                warning: Some(e.to_string()),
            },
        }
    }

    fn topic(&self, record: &ParsedRecord) -> (String, Vec<String>) {
        self.topic.render(record)
    }

    fn partition_key(&self, record: &ParsedRecord) -> (String, Vec<String>) {
        self.partition.render(record)
    }
}

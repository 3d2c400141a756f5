//! Process-wide `tracing` setup for hosts embedding the coherence bridge.
//!
//! Fatal consistency errors are reported through `tracing` right before the
//! process aborts, so a host should install a subscriber before serving pages.

use std::str::FromStr;

use anyhow::Context;
use serde::Deserialize;
use strum_macros::{EnumString, VariantNames};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::CoherenceConf;

/// Directive used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(
    EnumString,
    strum_macros::Display,
    VariantNames,
    Deserialize,
    Eq,
    PartialEq,
    Debug,
    Clone,
    Copy,
    Default,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
    /// Plain lines routed through libtest's capture.
    Test,
}

impl LogFormat {
    pub fn from_config(s: &str) -> anyhow::Result<LogFormat> {
        use strum::VariantNames;
        LogFormat::from_str(s).with_context(|| {
            format!(
                "Unrecognized log format. Please specify one of: {:?}",
                LogFormat::VARIANTS
            )
        })
    }
}

/// Where the logging should output to.
#[derive(Clone, Copy, Debug)]
pub enum Output {
    Stdout,
    Stderr,
}

fn make_writer(log_format: LogFormat, output: Output) -> BoxMakeWriter {
    match (log_format, output) {
        (LogFormat::Test, _) => BoxMakeWriter::new(tracing_subscriber::fmt::TestWriter::new()),
        (_, Output::Stdout) => BoxMakeWriter::new(std::io::stdout),
        (_, Output::Stderr) => BoxMakeWriter::new(std::io::stderr),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(log_format: LogFormat, output: Output) -> anyhow::Result<()> {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let log_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(make_writer(log_format, output));
    let log_layer = match log_format {
        LogFormat::Json => log_layer.json().boxed(),
        LogFormat::Plain | LogFormat::Test => log_layer.boxed(),
    };

    tracing_subscriber::registry()
        .with(log_layer.with_filter(env_filter))
        .try_init()
        .with_context(|| format!("failed to install the {log_format} tracing subscriber"))?;
    Ok(())
}

/// [`init`] with the format chosen in the config.
pub fn init_from_conf(conf: &CoherenceConf, output: Output) -> anyhow::Result<()> {
    init(conf.log_format, output)
}

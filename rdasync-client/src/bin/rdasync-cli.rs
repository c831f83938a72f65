//! # rdasync CLI
//!
//! Purpose: Send one command through a `Service` and print the reply.
//!
//! Usage: `rdasync-cli [alias=]<schema>://<address> <command> [args...]`
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`).

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use rdasync_client::{Command, Error, Service, ServiceConfig, Value};

const DEFAULT_ALIAS: &str = "cli";

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(target) = args.next() else {
        bail!("usage: rdasync-cli [alias=]<schema>://<address> <command> [args...]");
    };
    let command = Command::new(args.collect::<Vec<_>>()).context("missing command")?;

    let service = Service::new(ServiceConfig::default())?;
    let pool = service
        .add_connection_str(&with_alias(&target), Some(1))
        .with_context(|| format!("invalid connection string: {}", target))?;

    let failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));
    let on_result = {
        let service = service.clone();
        move |value: Value| {
            println!("{}", value);
            service.stop();
        }
    };
    let on_error = {
        let service = service.clone();
        let failure = failure.clone();
        move |err: Error| {
            *failure.lock() = Some(err);
            service.stop();
        }
    };
    service.execute(pool.alias(), command, on_result, on_error)?;
    service.run()?;

    let failure = failure.lock().take();
    match failure {
        Some(err) => {
            eprintln!("(error) {}", err);
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::SUCCESS),
    }
}

/// Prefixes a default alias unless the string already names one.
fn with_alias(target: &str) -> String {
    match (target.find('='), target.find("://")) {
        (Some(eq), Some(scheme)) if eq < scheme => target.to_string(),
        (Some(_), None) => target.to_string(),
        _ => format!("{}={}", DEFAULT_ALIAS, target),
    }
}

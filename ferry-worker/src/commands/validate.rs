use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use ferry_service::{HandlerFile, Step, WorkerConfig};

/// Validate a handler file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the handler YAML file
    pub handlers: PathBuf,

    /// Also check that the descriptor's event has a handler
    #[arg(long, value_name = "FILE")]
    pub descriptor: Option<PathBuf>,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    super::init_logging("warn");

    let path = &args.handlers;
    if !path.exists() {
        color_eyre::eyre::bail!("Handler file not found: {}", path.display());
    }

    output::status("Validating", &format!("{}", path.display()));

    let file = match HandlerFile::load(path) {
        Ok(file) => file,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };
    output::check("YAML syntax valid");
    output::check("Job names valid");

    for handler in &file.handlers {
        println!(
            "  {}/{}: {}",
            handler.source,
            handler.event_type,
            describe(&handler.run)
        );
    }

    if let Some(descriptor) = &args.descriptor {
        let config = match WorkerConfig::from_descriptor(descriptor) {
            Ok(config) => config,
            Err(e) => {
                output::error(&format!("Descriptor: {}", e));
                std::process::exit(1);
            }
        };
        let event = &config.event;
        let handled = file
            .handlers
            .iter()
            .any(|h| h.source == event.source && h.event_type == event.event_type);
        if handled {
            output::check(&format!(
                "Event {}/{} has a handler",
                event.source, event.event_type
            ));
        } else {
            output::warning(&format!(
                "No handler for event {}/{}; the run would only do bookkeeping",
                event.source, event.event_type
            ));
        }
    }

    println!();
    output::success(&format!(
        "{} handler(s), {} job(s)",
        file.handlers.len(),
        file.job_count()
    ));
    Ok(())
}

/// One-line outline of a step tree
fn describe(step: &Step) -> String {
    let nested = |steps: &[Step]| {
        steps
            .iter()
            .map(describe)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match step {
        Step::Job(job) => job.name.clone(),
        Step::Serial(steps) => format!("serial[{}]", nested(steps)),
        Step::Concurrent(steps) => format!("concurrent[{}]", nested(steps)),
        Step::Batched {
            max_concurrent,
            steps,
        } => format!("batched({})[{}]", max_concurrent, nested(steps)),
    }
}

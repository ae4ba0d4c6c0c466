//! `critest validate` command: run the conformance scenarios.

use clap::Args;

use a3s_critest_core::CriTestConfig;

use crate::validate::{run_suite, select};

#[derive(Args)]
pub struct ValidateArgs {
    /// Only run scenarios whose name contains this string
    #[arg(long)]
    pub focus: Option<String>,

    /// Number of scenarios run concurrently (overrides the config file)
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(
    args: ValidateArgs,
    mut config: CriTestConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
        config.validate()?;
    }

    let scenarios = select(args.focus.as_deref());
    if scenarios.is_empty() {
        return Err(format!(
            "no scenario matches focus '{}'",
            args.focus.unwrap_or_default()
        )
        .into());
    }

    let fw = super::connect_framework(config).await?;
    let report = run_suite(&fw, &scenarios).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render());
    }

    if !report.is_success() {
        return Err(format!("{} of {} scenarios failed", report.failed(), report.results.len()).into());
    }
    Ok(())
}

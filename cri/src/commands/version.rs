//! `critest version` command.

use clap::Args;

use a3s_critest_core::CriTestConfig;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(
    _args: VersionArgs,
    config: CriTestConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("critest version {}", a3s_critest_core::VERSION);

    let fw = super::connect_framework(config).await?;
    let version = fw.version().await?;
    println!("Version:           {}", version.version);
    println!("RuntimeName:       {}", version.runtime_name);
    println!("RuntimeVersion:    {}", version.runtime_version);
    println!("RuntimeApiVersion: {}", version.runtime_api_version);
    Ok(())
}

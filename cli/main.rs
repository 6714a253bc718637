use clap::Parser;
use wagerpool_app_cli_lib::Cli;

#[allow(clippy::print_stdout)]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let res = cli.run().await?;
    println!("{res}");
    Ok(())
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run the CLI, passing any extra arguments through
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Write `<file>.md5` next to an image for packaging
    Digest { file: PathBuf },
}

fn digest_file(file: &Path) -> Result<PathBuf> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let digest = fwflash_core::digest_of(&data);

    let mut name = file.as_os_str().to_owned();
    name.push(".md5");
    let out = PathBuf::from(name);
    std::fs::write(&out, format!("{}\n", digest))?;
    println!("{}  {}", digest, file.display());
    Ok(out)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            let status = Command::new("cargo").arg("build").status()?;
            if !status.success() {
                anyhow::bail!("Build failed");
            }
        }
        Commands::Run { args } => {
            println!("Running CLI...");
            let status = Command::new("cargo")
                .arg("run")
                .arg("-p")
                .arg("fwflash-cli")
                .arg("--")
                .args(args)
                .status()?;
            if !status.success() {
                anyhow::bail!("Run failed");
            }
        }
        Commands::Digest { file } => {
            let out = digest_file(file)?;
            println!("Wrote {}", out.display());
        }
    }

    Ok(())
}

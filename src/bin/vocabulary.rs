use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;

use gcnbow::{Vocabulary, VocabularyFormat};

/// Inspect and convert vocabulary files
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a vocabulary between formats
    Convert {
        /// Vocabulary to read
        #[arg(value_name = "INPUT")]
        input: PathBuf,
        /// Vocabulary to write
        #[arg(value_name = "OUTPUT")]
        output: PathBuf,
        /// Input format, guessed from the extension if omitted
        #[arg(long, value_enum)]
        from: Option<Format>,
        /// Output format, guessed from the extension if omitted
        #[arg(long, value_enum)]
        to: Option<Format>,
    },
    /// Print vocabulary parameters and check its structure
    Info {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long, value_enum)]
        format: Option<Format>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Binary,
    Text,
}

impl From<Format> for VocabularyFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Binary => VocabularyFormat::Binary,
            Format::Text => VocabularyFormat::Text,
        }
    }
}

fn load(path: &Path, format: Option<Format>) -> Result<Vocabulary> {
    let format = format.map_or_else(|| VocabularyFormat::from_path(path), Into::into);
    let now = Instant::now();
    let voc = Vocabulary::load_as(path, format)
        .with_context(|| format!("failed to load vocabulary {:?}", path))?;
    info!("Loading as {:?}: {:.2?}", format, now.elapsed());
    Ok(voc)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    match args.command {
        Command::Convert {
            input,
            output,
            from,
            to,
        } => {
            let voc = load(&input, from)?;
            let format = to.map_or_else(|| VocabularyFormat::from_path(&output), Into::into);
            let now = Instant::now();
            voc.save_as(&output, format)
                .with_context(|| format!("failed to save vocabulary {:?}", output))?;
            info!("Saving as {:?}: {:.2?}", format, now.elapsed());
        }
        Command::Info { file, format } => {
            let voc = load(&file, format)?;
            println!("{:#?}", voc);
            println!("nodes: {}", voc.num_nodes());
            match voc.check_invariants() {
                Ok(()) => println!("structure: ok"),
                Err(e) => println!("structure: {}", e),
            }
        }
    }

    Ok(())
}

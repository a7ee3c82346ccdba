// ABOUTME: Command-line surface — argument definitions and one-shot command handlers.
// ABOUTME: `run` hands off to the interactive operator loop in app.rs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::access::{AccessControlEngine, Classification, DangerousCommandFilter, GrantMode};
use crate::app::App;
use crate::config::{Config, StatePaths};
use crate::voice::AudioSample;

const DEFAULT_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Parser)]
#[command(name = "voicegate")]
#[command(about = "Voice and keyword privilege control for a local assistant", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// State directory (default: ~/.voicegate)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Interactive operator loop with the expiry sweep running
    Run,

    /// Print the dangerous-command verdict for a command
    Classify {
        /// The command text
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Change the spoken phrase for a mode
    SetKeyword {
        /// sudo or debug
        mode: GrantMode,
        /// The new phrase
        #[arg(trailing_var_arg = true, required = true)]
        phrase: Vec<String>,
    },

    /// Enroll the operator's voice from three raw f32 little-endian PCM files
    Enroll {
        #[arg(num_args = 3, required = true)]
        files: Vec<PathBuf>,

        #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
        sample_rate: u32,
    },

    /// Check a PCM sample against the enrolled profile without issuing a grant
    Verify {
        file: PathBuf,

        #[arg(long, default_value_t = DEFAULT_SAMPLE_RATE)]
        sample_rate: u32,
    },

    /// Show recent audit entries
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

/// Read a raw little-endian f32 mono PCM file.
pub fn read_pcm(path: &Path, sample_rate: u32) -> anyhow::Result<AudioSample> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    AudioSample::from_f32_le_bytes(sample_rate, &bytes)
        .with_context(|| format!("{} is not f32 PCM (length not a multiple of 4)", path.display()))
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let paths = cli.config_dir.map(StatePaths::new).unwrap_or_default();
    let config = Config::load(&paths)?;

    match cli.command {
        Command::Run => {
            let engine = AccessControlEngine::open(config, paths)?;
            App::new(engine).run().await
        }
        Command::Classify { command } => {
            let filter = DangerousCommandFilter::load(&paths.dangerous_patterns())?;
            match filter.classify(&command.join(" ")) {
                Classification::Safe => println!("safe"),
                Classification::Dangerous(hit) => {
                    println!("dangerous: {} ({})", hit.category, hit.signature)
                }
            }
            Ok(())
        }
        Command::SetKeyword { mode, phrase } => {
            let engine = AccessControlEngine::open(config, paths)?;
            let actor = engine.config().operator_id.clone();
            engine.set_keyword(mode, &phrase.join(" "), &actor)?;
            println!("{mode} phrase updated");
            Ok(())
        }
        Command::Enroll { files, sample_rate } => {
            let samples = files
                .iter()
                .map(|f| read_pcm(f, sample_rate))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let engine = AccessControlEngine::open(config, paths)?;
            let actor = engine.config().operator_id.clone();
            let committed = engine.enroll(&samples, &actor)?;
            if committed.replaced {
                println!("voice profile replaced for {}", committed.profile.owner_id);
            } else {
                println!("voice profile enrolled for {}", committed.profile.owner_id);
            }
            Ok(())
        }
        Command::Verify { file, sample_rate } => {
            let sample = read_pcm(&file, sample_rate)?;
            let engine = AccessControlEngine::open(config, paths)?;
            println!("{}", engine.verify_voice(&sample)?);
            Ok(())
        }
        Command::History { limit } => {
            let engine = AccessControlEngine::open(config, paths)?;
            for entry in engine.history(limit)? {
                println!("{entry}");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enroll_with_rate() {
        let cli = Cli::try_parse_from([
            "voicegate", "enroll", "a.pcm", "b.pcm", "c.pcm", "--sample-rate", "8000",
        ])
        .unwrap();
        match cli.command {
            Command::Enroll { files, sample_rate } => {
                assert_eq!(files.len(), 3);
                assert_eq!(sample_rate, 8000);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn enroll_needs_three_files() {
        assert!(Cli::try_parse_from(["voicegate", "enroll", "a.pcm", "b.pcm"]).is_err());
    }

    #[test]
    fn parses_set_keyword_phrase_words() {
        let cli = Cli::try_parse_from([
            "voicegate", "--config-dir", "/tmp/vg", "set-keyword", "debug", "open", "sesame",
        ])
        .unwrap();
        assert_eq!(cli.config_dir, Some(PathBuf::from("/tmp/vg")));
        match cli.command {
            Command::SetKeyword { mode, phrase } => {
                assert_eq!(mode, GrantMode::Debug);
                assert_eq!(phrase.join(" "), "open sesame");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn read_pcm_rejects_odd_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pcm");
        std::fs::write(&path, [0u8; 6]).unwrap();
        assert!(read_pcm(&path, 16_000).is_err());

        let good = dir.path().join("good.pcm");
        std::fs::write(&good, 0.25f32.to_le_bytes()).unwrap();
        assert_eq!(read_pcm(&good, 16_000).unwrap().samples, vec![0.25]);
    }
}

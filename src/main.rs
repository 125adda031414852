use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use clipseek::clip::{ClipModel, ImageEncoder};
use clipseek::config::{Config, MAX_EVAL_TOP_K, MAX_SEARCH_TOP_K};
use clipseek::evaluate::evaluate;
use clipseek::export::{export_evaluation, export_search, ExportFormat};
use clipseek::index::{EmbeddingCache, ImageIndex, Retriever};
use clipseek::train::{self, Checkpoint, ClipHead};
use clipseek::{logging, ClipseekError};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Index,
    Search {
        query: String,
        top_k: Option<usize>,
        output: Option<PathBuf>,
        format: Option<String>,
    },
    Train {
        resume: Option<PathBuf>,
    },
    Evaluate {
        top_k: Option<usize>,
        output: Option<PathBuf>,
        format: Option<String>,
    },
    Help,
    Version,
}

/// Parsed command line. Values not given keep the config file's settings.
#[derive(Debug, Clone, PartialEq)]
struct Cli {
    command: Command,
    config_path: Option<PathBuf>,
    verbose: bool,
    image_dir: Option<PathBuf>,
    checkpoint: Option<PathBuf>,
    no_checkpoint: bool,
    train: TrainOverrides,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct TrainOverrides {
    images_dir: Option<PathBuf>,
    metadata: Option<PathBuf>,
    filename_col: Option<String>,
    caption_col: Option<String>,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    lr: Option<f32>,
    weight_decay: Option<f32>,
    output_dir: Option<PathBuf>,
    seed: Option<u64>,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut cli = Cli {
        command: Command::Help,
        config_path: None,
        verbose: false,
        image_dir: None,
        checkpoint: None,
        no_checkpoint: false,
        train: TrainOverrides::default(),
    };

    let mut subcommand: Option<String> = None;
    let mut positional: Vec<String> = Vec::new();
    let mut top_k = None;
    let mut output = None;
    let mut format = None;
    let mut resume = None;

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => {
                cli.command = Command::Help;
                return Ok(cli);
            }
            "--version" | "-V" => {
                cli.command = Command::Version;
                return Ok(cli);
            }
            "--config" | "-c" => cli.config_path = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--verbose" | "-v" => cli.verbose = true,
            "--dir" | "-d" => cli.image_dir = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--checkpoint" => cli.checkpoint = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--no-checkpoint" => cli.no_checkpoint = true,
            "--top-k" | "-k" => top_k = Some(parse_number(arg, take_value(args, &mut i, arg)?)?),
            "--output" | "-o" => output = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--format" => format = Some(take_value(args, &mut i, arg)?.clone()),
            "--resume" => resume = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--images-dir" => cli.train.images_dir = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--metadata" => cli.train.metadata = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--filename-col" => cli.train.filename_col = Some(take_value(args, &mut i, arg)?.clone()),
            "--caption-col" => cli.train.caption_col = Some(take_value(args, &mut i, arg)?.clone()),
            "--epochs" => cli.train.epochs = Some(parse_number(arg, take_value(args, &mut i, arg)?)?),
            "--batch-size" => cli.train.batch_size = Some(parse_number(arg, take_value(args, &mut i, arg)?)?),
            "--lr" => cli.train.lr = Some(parse_number(arg, take_value(args, &mut i, arg)?)?),
            "--weight-decay" => cli.train.weight_decay = Some(parse_number(arg, take_value(args, &mut i, arg)?)?),
            "--output-dir" => cli.train.output_dir = Some(PathBuf::from(take_value(args, &mut i, arg)?)),
            "--seed" => cli.train.seed = Some(parse_number(arg, take_value(args, &mut i, arg)?)?),
            flag if flag.starts_with('-') && flag.len() > 1 => {
                return Err(anyhow!("Unknown argument: {}", flag));
            }
            word => {
                if subcommand.is_none() {
                    subcommand = Some(word.to_string());
                } else {
                    positional.push(word.to_string());
                }
            }
        }
        i += 1;
    }

    cli.command = match subcommand.as_deref() {
        None => Command::Help,
        Some("index") => Command::Index,
        Some("search") => {
            if positional.is_empty() {
                return Err(anyhow!("search requires a query"));
            }
            Command::Search {
                query: positional.join(" "),
                top_k,
                output,
                format,
            }
        }
        Some("train") => Command::Train { resume },
        Some("evaluate") | Some("eval") => Command::Evaluate { top_k, output, format },
        Some(other) => return Err(anyhow!("Unknown command: {}", other)),
    };

    Ok(cli)
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a String> {
    *i += 1;
    args.get(*i).ok_or_else(|| anyhow!("{} requires a value", flag))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("{} expects a number, got '{}'", flag, value))
}

fn print_help() {
    println!(
        r#"clipseek - search an image folder with natural-language queries

USAGE:
    clipseek [OPTIONS] <COMMAND>

COMMANDS:
    index                 Embed every image under the image directory
    search <QUERY>        Rank images against a text query
    train                 Fine-tune on image/caption pairs from a metadata CSV
    evaluate              Top-K accuracy using folder names as labels

OPTIONS:
    --config, -c PATH     Path to config file
    --dir, -d PATH        Image directory to index/search
    --checkpoint PATH     Adapter checkpoint to apply
    --no-checkpoint       Use the pretrained model as is
    --top-k, -k N         Number of results (search: 1-20, evaluate: 1-10)
    --output, -o FILE     Write results to FILE (.json, .csv or .html)
    --format FORMAT       Output format when FILE has no usable extension
    --verbose, -v         Also log to stderr (always on for index and train)
    --version, -V         Show version
    --help, -h            Show this help message

TRAINING OPTIONS:
    --images-dir PATH     Directory the metadata filenames are relative to
    --metadata PATH       CSV with filename and caption columns
    --filename-col NAME   Filename column (default: filename)
    --caption-col NAME    Caption column (default: caption)
    --epochs N            Number of epochs (default: 5)
    --batch-size N        Pairs per batch (default: 16)
    --lr RATE             Learning rate (default: 1e-4)
    --weight-decay W      AdamW weight decay (default: 0.01)
    --output-dir PATH     Checkpoint directory (default: ./checkpoints)
    --seed N              Seed for shuffling and augmentation
    --resume PATH         Continue from a checkpoint

ENVIRONMENT:
    CLIPSEEK_CONFIG       Path to config file (overrides default location)
    CLIPSEEK_LOG          Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/clipseek/config.toml"#
    );
}

fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(dir) = &cli.image_dir {
        config.image_dir = dir.clone();
    }
    if cli.no_checkpoint {
        config.checkpoint = None;
    } else if let Some(checkpoint) = &cli.checkpoint {
        config.checkpoint = Some(checkpoint.clone());
    }

    let t = &cli.train;
    let train = &mut config.train;
    if let Some(v) = &t.images_dir {
        train.images_dir = v.clone();
    }
    if let Some(v) = &t.metadata {
        train.metadata = v.clone();
    }
    if let Some(v) = &t.filename_col {
        train.filename_col = v.clone();
    }
    if let Some(v) = &t.caption_col {
        train.caption_col = v.clone();
    }
    if let Some(v) = t.epochs {
        train.epochs = v;
    }
    if let Some(v) = t.batch_size {
        train.batch_size = v;
    }
    if let Some(v) = t.lr {
        train.lr = v;
    }
    if let Some(v) = t.weight_decay {
        train.weight_decay = v;
    }
    if let Some(v) = &t.output_dir {
        train.output_dir = v.clone();
    }
    if t.seed.is_some() {
        train.seed = t.seed;
    }
}

/// Long-running commands report progress on stderr even without `--verbose`.
fn logs_to_stderr(cli: &Cli) -> bool {
    cli.verbose || matches!(cli.command, Command::Index | Command::Train { .. })
}

fn check_top_k(value: usize, max: usize) -> Result<usize> {
    if (1..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ClipseekError::InvalidTopK { value, max }.into())
    }
}

fn output_format(output: &Path, format: Option<&str>) -> Result<ExportFormat> {
    match format {
        Some(name) => ExportFormat::parse(name),
        None => ExportFormat::from_path(output),
    }
}

/// Load the configured checkpoint's head, if any.
fn load_head(config: &Config, encoder_name: &str) -> Result<Option<ClipHead>> {
    let Some(path) = config.active_checkpoint()? else {
        if let Some(missing) = &config.checkpoint {
            info!(path = %missing.display(), "No trained checkpoint yet, using pretrained model");
        }
        return Ok(None);
    };

    let checkpoint = Checkpoint::load(path)?;
    if checkpoint.model_state.encoder != encoder_name {
        warn!(
            checkpoint = %checkpoint.model_state.encoder,
            encoder = %encoder_name,
            "Checkpoint was trained on a different encoder"
        );
    }
    info!(path = %path.display(), epoch = checkpoint.epoch, "Loaded checkpoint");
    Ok(Some(checkpoint.head()?))
}

fn build_retriever<'a>(config: &Config, model: &'a ClipModel) -> Result<Retriever<'a, ClipModel>> {
    let cache = EmbeddingCache::open(&config.index.db_path)
        .with_context(|| format!("Failed to open index at {}", config.index.db_path.display()))?;
    let (index, _) = ImageIndex::from_directory(
        &config.image_dir,
        &config.index.image_extensions,
        model,
        Some(&cache),
        config.model.batch_size,
    )?;
    let head = load_head(config, model.model_name())?;
    Retriever::new(model, index, head, config.search.logit_scale)
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    apply_overrides(&mut config, &cli);

    let model = ClipModel::new(config.model.clone());

    match cli.command {
        Command::Help => print_help(),
        Command::Version => println!("clipseek {}", env!("CARGO_PKG_VERSION")),
        Command::Index => {
            let cache = EmbeddingCache::open(&config.index.db_path)?;
            let (index, stats) = ImageIndex::from_directory(
                &config.image_dir,
                &config.index.image_extensions,
                &model,
                Some(&cache),
                config.model.batch_size,
            )?;
            println!(
                "Indexed {} images from {} ({} cached, {} encoded, {} skipped)",
                index.len(),
                config.image_dir.display(),
                stats.cached,
                stats.encoded,
                stats.skipped
            );
            println!(
                "Embedding cache at {} holds {} images",
                config.index.db_path.display(),
                cache.count(model.model_name())?
            );
        }
        Command::Search {
            query,
            top_k,
            output,
            format,
        } => {
            let top_k = check_top_k(top_k.unwrap_or(config.search.top_k), MAX_SEARCH_TOP_K)?;
            let retriever = build_retriever(&config, &model)?;
            let hits = retriever.search(&query, top_k)?;

            if hits.is_empty() {
                println!("No matching images for '{}'", query);
            } else {
                println!("Results for '{}':", query);
                for (rank, hit) in hits.iter().enumerate() {
                    println!(
                        "{:>3}. {:6.2}%  {}",
                        rank + 1,
                        hit.probability * 100.0,
                        hit.path.display()
                    );
                }
            }

            if let Some(output) = output {
                let format = output_format(&output, format.as_deref())?;
                export_search(&query, &hits, &output, format)?;
                println!("Wrote {}", output.display());
            }
        }
        Command::Train { resume } => {
            let summary = train::run(&config.train, &model, config.model.batch_size, resume.as_deref())?;
            for stats in &summary.epochs {
                println!(
                    "Epoch {} avg_loss={:.4}, avg_acc={:.4}",
                    stats.epoch, stats.avg_loss, stats.avg_acc
                );
            }
            if let Some(best) = &summary.best_checkpoint {
                println!("Best model saved to {}", best.display());
            }
        }
        Command::Evaluate {
            top_k,
            output,
            format,
        } => {
            let k = check_top_k(top_k.unwrap_or(config.evaluate.top_k), MAX_EVAL_TOP_K)?;
            let retriever = build_retriever(&config, &model)?;
            let report = evaluate(&retriever, k, &config.evaluate.query_template)?;

            println!(
                "Top-{} accuracy: {:.2}% ({} of {} labels)",
                k, report.accuracy, report.hits, report.labels
            );
            for result in &report.results {
                println!(
                    "  [{}] {:<24} {}",
                    if result.hit { "hit " } else { "miss" },
                    result.label,
                    result.top_k.join(", ")
                );
            }

            if let Some(output) = output {
                let format = output_format(&output, format.as_deref())?;
                export_evaluation(&report, &output, format)?;
                println!("Wrote {}", output.display());
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("clipseek {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    // Uses journald on Linux, file fallback otherwise
    let _ = logging::init(Some(Config::config_dir().join("logs")), logs_to_stderr(&cli));

    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_search_query_joins_words() {
        let cli = parse_args(&args("search white suv -k 3 --dir /cars")).unwrap();
        assert_eq!(
            cli.command,
            Command::Search {
                query: "white suv".to_string(),
                top_k: Some(3),
                output: None,
                format: None,
            }
        );
        assert_eq!(cli.image_dir, Some(PathBuf::from("/cars")));
    }

    #[test]
    fn test_train_overrides() {
        let cli = parse_args(&args("-c my.toml train --epochs 2 --lr 5e-6 --seed 9 --resume ck.json")).unwrap();
        assert_eq!(cli.config_path, Some(PathBuf::from("my.toml")));
        assert_eq!(cli.command, Command::Train { resume: Some(PathBuf::from("ck.json")) });

        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.train.epochs, 2);
        assert!((config.train.lr - 5e-6).abs() < 1e-12);
        assert_eq!(config.train.seed, Some(9));
        assert_eq!(config.train.batch_size, 16);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args("search")).is_err());
        assert!(parse_args(&args("frobnicate")).is_err());
        assert!(parse_args(&args("evaluate --top-k")).is_err());
        assert!(parse_args(&args("evaluate --top-k five")).is_err());
        assert!(parse_args(&args("index --bogus")).is_err());
    }

    #[test]
    fn test_no_checkpoint_wins() {
        let cli = parse_args(&args("evaluate --checkpoint a.json --no-checkpoint")).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &cli);
        assert!(config.checkpoint.is_none());
    }

    #[test]
    fn test_explicit_missing_checkpoint_fails() {
        let cli = parse_args(&args("search red car --checkpoint /no/such/typo.json")).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &cli);

        let err = load_head(&config, "clip-vit-b32").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClipseekError>(),
            Some(ClipseekError::CheckpointNotFound { .. })
        ));
    }

    #[test]
    fn test_long_running_commands_log_to_stderr() {
        assert!(logs_to_stderr(&parse_args(&args("index")).unwrap()));
        assert!(logs_to_stderr(&parse_args(&args("train --epochs 1")).unwrap()));
        assert!(!logs_to_stderr(&parse_args(&args("search red")).unwrap()));
        assert!(logs_to_stderr(&parse_args(&args("search red -v")).unwrap()));
    }

    #[test]
    fn test_top_k_bounds() {
        assert!(check_top_k(1, MAX_SEARCH_TOP_K).is_ok());
        assert!(check_top_k(20, MAX_SEARCH_TOP_K).is_ok());
        assert!(check_top_k(0, MAX_SEARCH_TOP_K).is_err());
        assert!(check_top_k(11, MAX_EVAL_TOP_K).is_err());
    }
}

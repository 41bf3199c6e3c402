use std::fmt;

use storage::repository::{PriceBookEntry, Storage};

/// Built-in prices in micro-USD per million tokens: (provider, model, input, cached input, output).
const DEFAULT_PRICES: [(&str, &str, u64, u64, u64); 3] = [
    ("openai", "gpt-4o-mini", 150_000, 75_000, 600_000),
    ("openai", "gpt-4o", 2_500_000, 1_250_000, 10_000_000),
    ("openai", "gpt-4.1-mini", 400_000, 100_000, 1_600_000),
];

#[derive(Debug, Clone)]
struct Args {
    db_url: String,
    provider: String,
    model: Option<String>,
    input: Option<u64>,
    cached_input: Option<u64>,
    output: Option<u64>,
    deprecated: bool,
}

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidPrice { flag: &'static str, raw: String },
    IncompleteEntry,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidPrice { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::IncompleteEntry => {
                write!(f, "--model requires --input and --output prices")
            }
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_price(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<u64, ArgsError> {
    let value = require_value(args, flag)?;
    value
        .parse::<u64>()
        .map_err(|_| ArgsError::InvalidPrice { flag, raw: value.clone() })
}

impl Args {
    fn parse() -> Result<Self, ArgsError> {
        let mut db_url =
            std::env::var("QUDRAT_DB_URL").unwrap_or_else(|_| "sqlite:qudrat.sqlite3".into());
        let mut provider =
            std::env::var("QUDRAT_AI_PROVIDER").unwrap_or_else(|_| "openai".into());
        let mut model = None;
        let mut input = None;
        let mut cached_input = None;
        let mut output = None;
        let mut deprecated = false;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = value;
                }
                "--provider" => provider = require_value(&mut args, "--provider")?,
                "--model" => model = Some(require_value(&mut args, "--model")?),
                "--input" => input = Some(parse_price(&mut args, "--input")?),
                "--cached-input" => cached_input = Some(parse_price(&mut args, "--cached-input")?),
                "--output" => output = Some(parse_price(&mut args, "--output")?),
                "--deprecated" => deprecated = true,
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        if model.is_some() && (input.is_none() || output.is_none()) {
            return Err(ArgsError::IncompleteEntry);
        }

        Ok(Self {
            db_url,
            provider,
            model,
            input,
            cached_input,
            output,
            deprecated,
        })
    }

    fn entries(&self) -> Vec<PriceBookEntry> {
        match (&self.model, self.input, self.output) {
            (Some(model), Some(input), Some(output)) => vec![PriceBookEntry {
                provider: self.provider.clone(),
                model: model.clone(),
                input_micro_usd_per_million: input,
                cached_input_micro_usd_per_million: self.cached_input.unwrap_or(input),
                output_micro_usd_per_million: output,
                deprecated: self.deprecated,
            }],
            _ => DEFAULT_PRICES
                .iter()
                .map(|(provider, model, input, cached, output)| PriceBookEntry {
                    provider: (*provider).to_string(),
                    model: (*model).to_string(),
                    input_micro_usd_per_million: *input,
                    cached_input_micro_usd_per_million: *cached,
                    output_micro_usd_per_million: *output,
                    deprecated: false,
                })
                .collect(),
        }
    }
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p storage --bin seed -- [options]");
    eprintln!();
    eprintln!("Seeds the generation price book. Without --model the built-in prices are written.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>         SQLite URL (default: sqlite:qudrat.sqlite3)");
    eprintln!("  --provider <name>         Provider of the entry (default: openai)");
    eprintln!("  --model <name>            Model to upsert");
    eprintln!("  --input <micro_usd>       Input price per million tokens");
    eprintln!("  --cached-input <micro_usd> Cached input price per million tokens (default: input)");
    eprintln!("  --output <micro_usd>      Output price per million tokens");
    eprintln!("  --deprecated              Mark the entry deprecated");
    eprintln!("  -h, --help                Show this help");
    eprintln!();
    eprintln!("Environment (same as flags):");
    eprintln!("  QUDRAT_DB_URL, QUDRAT_AI_PROVIDER");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse().map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    let storage = Storage::sqlite(&args.db_url).await?;
    let entries = args.entries();
    for entry in &entries {
        storage.price_book.upsert_entry(entry).await?;
    }

    println!(
        "Seeded {} price book entries into {}",
        entries.len(),
        args.db_url
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

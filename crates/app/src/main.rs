use std::fmt;
use std::str::FromStr;

use qudrat_core::model::{Difficulty, Section, SessionId, SessionKind, TimeSnapshot, Track, UserId};
use services::sessions::DEFAULT_LIST_LIMIT;
use services::{
    AppServices, Clock, CreateSession, FinishAction, ServiceConfig, SessionError, SessionService,
    SubmitAnswer,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_DB_URL: &str = "sqlite:qudrat.sqlite3";
const DEFAULT_EXAM_QUESTIONS: u32 = 96;
const DEFAULT_PRACTICE_QUESTIONS: u32 = 20;

#[derive(Debug)]
enum ArgsError {
    MissingCommand,
    UnknownCommand(String),
    MissingValue { flag: &'static str },
    MissingFlag { flag: &'static str },
    UnknownArg(String),
    InvalidValue { flag: &'static str, raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingCommand => write!(f, "a command is required"),
            ArgsError::UnknownCommand(cmd) => write!(f, "unknown command: {cmd}"),
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingFlag { flag } => write!(f, "{flag} is required"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidValue { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
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

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- <command> --user <uuid> [--db <sqlite_url>] [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  create  [--kind exam|practice] [--track scientific|literary] [--section verbal|quantitative]");
    eprintln!("          [--total <n>] [--category <name>]... [--difficulty easy|medium|hard]");
    eprintln!("  pause   --session <id> [--remaining <secs>] [--spent <secs>]");
    eprintln!("  resume  --session <id>");
    eprintln!("  answer  --session <id> --question <index> --choice <0-3> [--time <secs>]");
    eprintln!("  finish  --session <id> --action complete|abandon [--spent <secs>]");
    eprintln!("  refill  --session <id> [--difficulty easy|medium|hard]");
    eprintln!("  show    --session <id>");
    eprintln!("  list    [--limit <n>]");
    eprintln!("  stats   --session <id>");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db {DEFAULT_DB_URL}");
    eprintln!("  --kind exam --track scientific");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  QUDRAT_DB_URL, QUDRAT_USER_ID, QUDRAT_AI_API_KEY, QUDRAT_AI_BASE_URL, QUDRAT_AI_MODEL");
    eprintln!("  QUDRAT_BATCH_SIZE, QUDRAT_GENERATION_TIMEOUT_SECS, QUDRAT_DAILY_BATCH_CAP, QUDRAT_COOLDOWN_SECS");
    eprintln!("  RUST_LOG (default: info)");
}

//
// ─── ARGUMENTS ─────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Create(CreateArgs),
    Pause {
        session_id: SessionId,
        snapshot: TimeSnapshot,
    },
    Resume {
        session_id: SessionId,
    },
    Answer {
        session_id: SessionId,
        question_index: u32,
        selected_answer: u8,
        time_spent_secs: u32,
    },
    Finish {
        session_id: SessionId,
        action: FinishAction,
        time_spent_secs: Option<u64>,
    },
    Refill {
        session_id: SessionId,
        difficulty: Option<Difficulty>,
    },
    Show {
        session_id: SessionId,
    },
    List {
        limit: u32,
    },
    Stats {
        session_id: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CreateArgs {
    kind: SessionKind,
    total_questions: u32,
    categories: Vec<String>,
    difficulty: Option<Difficulty>,
}

/// Flag values as given, before they are checked against the command.
#[derive(Debug, Default)]
struct RawFlags {
    kind: Option<String>,
    track: Option<String>,
    section: Option<String>,
    total: Option<String>,
    categories: Vec<String>,
    difficulty: Option<String>,
    session: Option<String>,
    remaining: Option<String>,
    spent: Option<String>,
    question: Option<String>,
    choice: Option<String>,
    time: Option<String>,
    action: Option<String>,
    limit: Option<String>,
}

struct Args {
    db_url: String,
    user_id: UserId,
    command: Command,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let name = args.next().ok_or(ArgsError::MissingCommand)?;
        if name == "--help" || name == "-h" {
            print_usage();
            std::process::exit(0);
        }

        let mut db_url = std::env::var("QUDRAT_DB_URL").unwrap_or_else(|_| DEFAULT_DB_URL.into());
        let mut user = std::env::var("QUDRAT_USER_ID").ok();
        let mut flags = RawFlags::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(&mut args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidValue {
                            flag: "--db",
                            raw: value,
                        });
                    }
                    db_url = value;
                }
                "--user" => user = Some(require_value(&mut args, "--user")?),
                "--kind" => flags.kind = Some(require_value(&mut args, "--kind")?),
                "--track" => flags.track = Some(require_value(&mut args, "--track")?),
                "--section" => flags.section = Some(require_value(&mut args, "--section")?),
                "--total" => flags.total = Some(require_value(&mut args, "--total")?),
                "--category" => flags.categories.push(require_value(&mut args, "--category")?),
                "--difficulty" => {
                    flags.difficulty = Some(require_value(&mut args, "--difficulty")?);
                }
                "--session" => flags.session = Some(require_value(&mut args, "--session")?),
                "--remaining" => flags.remaining = Some(require_value(&mut args, "--remaining")?),
                "--spent" => flags.spent = Some(require_value(&mut args, "--spent")?),
                "--question" => flags.question = Some(require_value(&mut args, "--question")?),
                "--choice" => flags.choice = Some(require_value(&mut args, "--choice")?),
                "--time" => flags.time = Some(require_value(&mut args, "--time")?),
                "--action" => flags.action = Some(require_value(&mut args, "--action")?),
                "--limit" => flags.limit = Some(require_value(&mut args, "--limit")?),
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let user = user.ok_or(ArgsError::MissingFlag { flag: "--user" })?;
        let user_id = UserId::from_str(user.trim()).map_err(|_| ArgsError::InvalidValue {
            flag: "--user",
            raw: user.clone(),
        })?;

        Ok(Self {
            db_url,
            user_id,
            command: Command::build(&name, flags)?,
        })
    }
}

impl Command {
    fn build(name: &str, flags: RawFlags) -> Result<Self, ArgsError> {
        let session = || -> Result<SessionId, ArgsError> {
            required(parse_number::<u64>(flags.session.clone(), "--session")?, "--session")
                .map(SessionId::new)
        };

        let command = match name {
            "create" => Command::Create(CreateArgs::build(&flags)?),
            "pause" => Command::Pause {
                session_id: session()?,
                snapshot: TimeSnapshot {
                    remaining_time_secs: parse_number(flags.remaining.clone(), "--remaining")?,
                    time_spent_secs: parse_number(flags.spent.clone(), "--spent")?,
                },
            },
            "resume" => Command::Resume {
                session_id: session()?,
            },
            "answer" => Command::Answer {
                session_id: session()?,
                question_index: required(
                    parse_number(flags.question.clone(), "--question")?,
                    "--question",
                )?,
                selected_answer: required(parse_number(flags.choice.clone(), "--choice")?, "--choice")?,
                time_spent_secs: parse_number(flags.time.clone(), "--time")?.unwrap_or(0),
            },
            "finish" => Command::Finish {
                session_id: session()?,
                action: parse_action(flags.action.as_deref())?,
                time_spent_secs: parse_number(flags.spent.clone(), "--spent")?,
            },
            "refill" => Command::Refill {
                session_id: session()?,
                difficulty: parse_difficulty(flags.difficulty.as_deref())?,
            },
            "show" => Command::Show {
                session_id: session()?,
            },
            "list" => Command::List {
                limit: parse_number(flags.limit.clone(), "--limit")?.unwrap_or(DEFAULT_LIST_LIMIT),
            },
            "stats" => Command::Stats {
                session_id: session()?,
            },
            other => return Err(ArgsError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

impl CreateArgs {
    fn build(flags: &RawFlags) -> Result<Self, ArgsError> {
        let kind = match flags.kind.as_deref().map(str::trim) {
            None | Some("exam") => {
                let track = match flags.track.as_deref() {
                    None => Track::Scientific,
                    Some(raw) => Track::from_label(raw).ok_or_else(|| ArgsError::InvalidValue {
                        flag: "--track",
                        raw: raw.to_string(),
                    })?,
                };
                SessionKind::Exam { track }
            }
            Some("practice") => {
                let raw = flags
                    .section
                    .as_deref()
                    .ok_or(ArgsError::MissingFlag { flag: "--section" })?;
                let section = Section::from_label(raw).ok_or_else(|| ArgsError::InvalidValue {
                    flag: "--section",
                    raw: raw.to_string(),
                })?;
                SessionKind::Practice { section }
            }
            Some(other) => {
                return Err(ArgsError::InvalidValue {
                    flag: "--kind",
                    raw: other.to_string(),
                });
            }
        };

        let default_total = if kind.is_exam() {
            DEFAULT_EXAM_QUESTIONS
        } else {
            DEFAULT_PRACTICE_QUESTIONS
        };

        Ok(Self {
            kind,
            total_questions: parse_number(flags.total.clone(), "--total")?.unwrap_or(default_total),
            categories: flags.categories.clone(),
            difficulty: parse_difficulty(flags.difficulty.as_deref())?,
        })
    }
}

fn parse_number<T: FromStr>(raw: Option<String>, flag: &'static str) -> Result<Option<T>, ArgsError> {
    raw.map(|raw| {
        raw.trim()
            .parse::<T>()
            .map_err(|_| ArgsError::InvalidValue { flag, raw })
    })
    .transpose()
}

fn required<T>(value: Option<T>, flag: &'static str) -> Result<T, ArgsError> {
    value.ok_or(ArgsError::MissingFlag { flag })
}

fn parse_difficulty(raw: Option<&str>) -> Result<Option<Difficulty>, ArgsError> {
    raw.map(|raw| {
        Difficulty::from_label(raw).ok_or_else(|| ArgsError::InvalidValue {
            flag: "--difficulty",
            raw: raw.to_string(),
        })
    })
    .transpose()
}

fn parse_action(raw: Option<&str>) -> Result<FinishAction, ArgsError> {
    match raw.map(str::trim) {
        Some("complete") => Ok(FinishAction::Complete),
        Some("abandon") => Ok(FinishAction::Abandon),
        Some(other) => Err(ArgsError::InvalidValue {
            flag: "--action",
            raw: other.to_string(),
        }),
        None => Err(ArgsError::MissingFlag { flag: "--action" }),
    }
}

//
// ─── EXECUTION ─────────────────────────────────────────────────────────────────
//

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()?;
    Ok(())
}

async fn execute(
    sessions: &SessionService,
    user_id: UserId,
    command: Command,
) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let value = match command {
        Command::Create(args) => serde_json::to_value(
            sessions
                .create_session(CreateSession {
                    user_id,
                    kind: args.kind,
                    total_questions: args.total_questions,
                    categories: args.categories,
                    difficulty: args.difficulty,
                })
                .await?,
        )?,
        Command::Pause {
            session_id,
            snapshot,
        } => serde_json::to_value(sessions.pause(session_id, user_id, snapshot).await?)?,
        Command::Resume { session_id } => {
            serde_json::to_value(sessions.resume(session_id, user_id).await?)?
        }
        Command::Answer {
            session_id,
            question_index,
            selected_answer,
            time_spent_secs,
        } => serde_json::to_value(
            sessions
                .submit_answer(SubmitAnswer {
                    session_id,
                    user_id,
                    question_index,
                    selected_answer,
                    time_spent_secs,
                })
                .await?,
        )?,
        Command::Finish {
            session_id,
            action,
            time_spent_secs,
        } => serde_json::to_value(
            sessions
                .finish(session_id, user_id, action, time_spent_secs)
                .await?,
        )?,
        Command::Refill {
            session_id,
            difficulty,
        } => serde_json::to_value(sessions.refill(session_id, user_id, difficulty).await?)?,
        Command::Show { session_id } => {
            serde_json::to_value(sessions.get_session(session_id, user_id).await?)?
        }
        Command::List { limit } => {
            serde_json::to_value(sessions.list_sessions(user_id, limit).await?)?
        }
        Command::Stats { session_id } => {
            serde_json::to_value(sessions.generation_stats(session_id, user_id).await?)?
        }
    };
    Ok(value)
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse(std::env::args().skip(1)).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    init_tracing()?;
    let config = ServiceConfig::from_env()?;
    let services = AppServices::new_sqlite(&args.db_url, Clock::default_clock(), config).await?;
    tracing::debug!(
        db_url = %args.db_url,
        generation_enabled = services.generation_enabled(),
        "services ready"
    );

    let output = execute(&services.sessions(), args.user_id, args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // Students see the localized message; the cause goes to stderr as well.
        if let Some(session_err) = err.downcast_ref::<SessionError>() {
            eprintln!("{}", session_err.user_message());
        }
        eprintln!("{err}");
        std::process::exit(2);
    }
}

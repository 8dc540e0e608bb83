use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Instant;
use vigil_core::{Config, OnnxEmbedder, Person, PersonId};
use vigil_store::{PersonUpdate, Store, UnknownFilter, VisitFilter};
use vigil_stream::{StreamSource, ThreadSleeper};

mod enroll;

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil entrance face recognition CLI")]
struct Cli {
    /// Configuration file (default: $VIGIL_CONFIG or /etc/vigil/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage known persons
    #[command(subcommand)]
    Person(PersonCommand),
    /// List recorded visits, newest first
    Visits {
        /// Only visits of this person
        #[arg(long)]
        person: Option<PersonId>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// List unknown sightings awaiting identification
    Unknown {
        /// Show already identified sightings instead
        #[arg(long)]
        identified: bool,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Attribute an unknown sighting to a known person
    Identify { unknown_id: i64, person_id: PersonId },
    /// Show visit statistics
    Stats,
    /// Show daemon status
    Status,
    /// Open the configured stream once and report what it delivers
    Test,
}

#[derive(Subcommand)]
enum PersonCommand {
    /// Enroll a new person from one or more photos
    Add {
        #[arg(short, long)]
        name: String,
        /// Photo containing the person's face (repeatable)
        #[arg(short, long = "image", required = true)]
        images: Vec<PathBuf>,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Add reference photos to an existing person
    AddFace {
        id: PersonId,
        #[arg(short, long = "image", required = true)]
        images: Vec<PathBuf>,
    },
    /// List known persons
    List,
    /// Show one person
    Show { id: PersonId },
    /// Rename a person or change their notes
    Update {
        id: PersonId,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove a person with their embeddings and visits
    Remove { id: PersonId },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Person(cmd) => person(&config, &out, cmd),
        Commands::Visits { person, limit } => {
            let store = open_store(&config)?;
            let visits = store.list_visits(&VisitFilter {
                person_id: person,
                since: None,
                limit,
            })?;
            out.print(&visits, || {
                if visits.is_empty() {
                    println!("No visits recorded");
                }
                for v in &visits {
                    println!(
                        "{:>6}  {}  {:<20} {:>5.1}%  {}",
                        v.id,
                        v.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        v.person_name,
                        v.confidence * 100.0,
                        v.image_path.display()
                    );
                }
            })
        }
        Commands::Unknown { identified, limit } => {
            let store = open_store(&config)?;
            let sightings = store.list_unknown(&UnknownFilter { identified, limit })?;
            out.print(&sightings, || {
                if sightings.is_empty() {
                    println!("No unknown sightings");
                }
                for u in &sightings {
                    let who = u
                        .identified_as
                        .map(|id| format!("-> person {id}"))
                        .unwrap_or_default();
                    println!(
                        "{:>6}  {}  {}  {who}",
                        u.id,
                        u.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        u.image_path.display()
                    );
                }
            })
        }
        Commands::Identify {
            unknown_id,
            person_id,
        } => {
            let mut store = open_store(&config)?;
            store.mark_identified(unknown_id, person_id)?;
            let person = store.get_person(person_id)?;
            println!("Sighting {unknown_id} identified as {} ({person_id})", person.name);
            Ok(())
        }
        Commands::Stats => {
            let stats = open_store(&config)?.stats(chrono::Utc::now())?;
            out.print(&stats, || {
                println!("Known persons:   {}", stats.total_persons);
                println!("Total visits:    {}", stats.total_visits);
                println!("Visits today:    {}", stats.visits_today);
                println!("Unidentified:    {}", stats.unknown_count);
                match &stats.most_frequent_visitor {
                    Some(v) => println!("Most frequent:   {} ({} visits)", v.name, v.count),
                    None => println!("Most frequent:   -"),
                }
            })
        }
        Commands::Status => status(&config, &out),
        Commands::Test => stream_test(&config, &out),
    }
}

fn person(config: &Config, out: &Output, cmd: PersonCommand) -> Result<()> {
    let mut store = open_store(config)?;
    match cmd {
        PersonCommand::Add {
            name,
            images,
            notes,
        } => {
            let embeddings = enroll::embed_images(&mut load_embedder(config)?, &images)?;
            let id = store.add_person(&name, &embeddings, &notes)?;
            tracing::info!(id, name = %name, embeddings = embeddings.len(), "person enrolled");
            println!("Enrolled {name} as person {id} ({} embeddings)", embeddings.len());
        }
        PersonCommand::AddFace { id, images } => {
            // Fail on an unknown id before loading the models.
            let person = store.get_person(id)?;
            let embeddings = enroll::embed_images(&mut load_embedder(config)?, &images)?;
            store.add_embeddings(id, &embeddings)?;
            println!(
                "Added {} embeddings to {} ({} total)",
                embeddings.len(),
                person.name,
                person.embeddings.len() + embeddings.len()
            );
        }
        PersonCommand::List => {
            let persons = store.list_persons()?;
            out.print(&persons, || {
                if persons.is_empty() {
                    println!("No persons enrolled");
                }
                for p in &persons {
                    print_person_line(p);
                }
            })?;
        }
        PersonCommand::Show { id } => {
            let p = store.get_person(id)?;
            out.print(&p, || {
                print_person_line(&p);
                println!("  embeddings: {}", p.embeddings.len());
                if !p.notes.is_empty() {
                    println!("  notes:      {}", p.notes);
                }
                if let Some(first) = p.first_seen {
                    println!("  first seen: {}", first.format("%Y-%m-%d %H:%M:%S"));
                }
            })?;
        }
        PersonCommand::Update { id, name, notes } => {
            if name.is_none() && notes.is_none() {
                bail!("nothing to update, pass --name and/or --notes");
            }
            store.update_person(id, &PersonUpdate { name, notes })?;
            println!("Updated person {id}");
        }
        PersonCommand::Remove { id } => {
            let p = store.get_person(id)?;
            store.delete_person(id)?;
            println!("Removed {} ({id})", p.name);
        }
    }
    Ok(())
}

fn print_person_line(p: &Person) {
    let last = p
        .last_seen
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".into());
    println!(
        "{:>4}  {:<24} visits: {:<5} last seen: {last}",
        p.id, p.name, p.visit_count
    );
}

fn status(config: &Config, out: &Output) -> Result<()> {
    let path = config.storage.status_path();
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("vigild: no status at {} (not running?)", path.display());
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let status: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("malformed {}", path.display()))?;

    out.print(&status, || {
        let field = |key: &str| match &status[key] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => "-".into(),
            other => other.to_string(),
        };
        println!("vigild: {} ({})", field("state"), field("source"));
        println!("  since:            {}", field("state_since"));
        println!("  updated:          {}", field("updated_at"));
        println!("  frames read:      {}", field("frames_read"));
        println!("  frames processed: {}", field("frames_processed"));
        println!("  visits/unknowns:  {}/{}", field("visits"), field("unknowns"));
        println!("  known persons:    {}", field("known_persons"));
        println!("  restarts:         {}", field("restarts"));
        println!("  last error:       {}", field("last_error"));
    })
}

#[derive(Serialize)]
struct StreamReport {
    source: String,
    width: u32,
    height: u32,
    first_frame_ms: u128,
}

fn stream_test(config: &Config, out: &Output) -> Result<()> {
    let source = config.dvr.redacted_uri();
    eprintln!("Opening {source}...");

    let started = Instant::now();
    let mut stream = StreamSource::open(
        vigil_stream::connector_for(&config.dvr),
        vigil_stream::reconnect_policy(&config.dvr),
        Box::new(ThreadSleeper),
    )
    .with_context(|| format!("could not open {source}"))?;
    let frame = stream
        .read_frame()
        .with_context(|| format!("no frame from {source}"))?;
    stream.close();

    let Some(frame) = frame else {
        bail!("{source} ended before delivering a frame");
    };
    let report = StreamReport {
        source,
        width: frame.width,
        height: frame.height,
        first_frame_ms: started.elapsed().as_millis(),
    };
    out.print(&report, || {
        println!(
            "OK: {} delivers {}x{} (first frame after {}ms)",
            report.source, report.width, report.height, report.first_frame_ms
        );
    })
}

fn open_store(config: &Config) -> Result<Store> {
    let path = config.storage.db_path();
    Store::open(&path).with_context(|| format!("failed to open database at {}", path.display()))
}

fn load_embedder(config: &Config) -> Result<OnnxEmbedder> {
    OnnxEmbedder::load(
        &config.models.scrfd_model_path(),
        &config.models.arcface_model_path(),
        config.recognition.min_detection_confidence,
        config.recognition.min_face_size,
    )
    .with_context(|| format!("failed to load models from {}", config.models.model_dir.display()))
}

/// Chooses between human-readable and JSON output.
struct Output {
    json: bool,
}

impl Output {
    fn print<T: Serialize + ?Sized>(&self, value: &T, human: impl FnOnce()) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

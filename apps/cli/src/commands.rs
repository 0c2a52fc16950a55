//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::info;

use scanmark_core::access::{require_manager, require_scanner};
use scanmark_core::ingest::{BundleUpload, PageScan, ProgressReporter, ingest};
use scanmark_core::review::{self, ReviewOutcome};
use scanmark_core::{RubricLedger, TaskEngine, pqv};
use scanmark_shared::{
    AppConfig, AssessmentLayout, BundleId, BundleSummary, Caller, IdPrediction, ImageId,
    MarkSubmission, PageKind, Permission, Role, Rubric, RubricDraft, RubricId, RubricKind,
    RubricPatch, RubricRef, ScannedPage, Task, TaskFilter, TaskId, TaskKind, TaskStatus,
    init_config, load_config,
};
use scanmark_storage::{CollisionKeep, Disposition, IdentifySubmission, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// scanmark: identify scanned exam pages and hand out marking work.
#[derive(Parser)]
#[command(
    name = "scanmark",
    version,
    about = "Track scanned assessment pages from upload to marked result.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Database file (defaults to `[defaults] database_path`).
    #[arg(long, global = true, env = "SCANMARK_DB")]
    pub db: Option<PathBuf>,

    /// User the command acts as.
    #[arg(long, global = true, env = "SCANMARK_USER", default_value = "admin")]
    pub user: String,

    /// Role of that user: scanner, marker or manager.
    #[arg(long, global = true, env = "SCANMARK_ROLE", default_value = "manager")]
    pub role: Role,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Assessment layout.
    Layout {
        #[command(subcommand)]
        action: LayoutAction,
    },

    /// Paper-question-version table.
    Pqv {
        #[command(subcommand)]
        action: PqvAction,
    },

    /// Scan bundles.
    Bundle {
        #[command(subcommand)]
        action: BundleAction,
    },

    /// Review actions on single page images.
    Page {
        #[command(subcommand)]
        action: PageAction,
    },

    /// Identify and marking tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Rubrics.
    Rubric {
        #[command(subcommand)]
        action: RubricAction,
    },

    /// Quotas and permissions.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Derived paper state and ID predictions.
    Paper {
        #[command(subcommand)]
        action: PaperAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

#[derive(Subcommand)]
pub(crate) enum LayoutAction {
    /// Load the layout from a TOML file.
    Load { file: PathBuf },
    /// Print the loaded layout.
    Show,
}

#[derive(Subcommand)]
pub(crate) enum PqvAction {
    /// Generate and commit versions for papers 1..=N.
    Build {
        #[arg(long)]
        papers: u32,
        /// RNG seed (defaults to `[pqv] seed`).
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Write the committed table as CSV.
    Export { file: PathBuf },
    /// Validate and commit a CSV table.
    Import { file: PathBuf },
    /// Add papers that copy the versions of a template paper.
    Append {
        #[arg(long)]
        template: u32,
        #[arg(long, value_delimiter = ',', required = true)]
        papers: Vec<u32>,
    },
}

#[derive(Subcommand)]
pub(crate) enum BundleAction {
    /// Upload a bundle described by a JSON manifest.
    Upload { manifest: PathBuf },
    /// Show one bundle, or list all of them.
    Status { id: Option<BundleId> },
    /// List pages an operator must act on.
    Review { id: BundleId },
    /// Attach a reviewed bundle's pages to their papers.
    Push { id: BundleId },
}

#[derive(Subcommand)]
pub(crate) enum PageAction {
    /// Take a page out of consideration.
    Discard {
        image: ImageId,
        #[arg(long, default_value = "discarded by reviewer")]
        reason: String,
    },
    /// Settle a collision.
    Resolve {
        image: ImageId,
        #[arg(long)]
        keep: Keep,
    },
    /// Attach an extra page to questions of a paper.
    Assign {
        image: ImageId,
        #[arg(long)]
        paper: u32,
        #[arg(long, value_delimiter = ',', required = true)]
        questions: Vec<u32>,
    },
    /// Classify an unknown page by hand.
    Dispose {
        image: ImageId,
        #[command(subcommand)]
        disposition: DisposeAs,
    },
}

/// Which image survives a collision.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub(crate) enum Keep {
    Incoming,
    Existing,
}

#[derive(Subcommand)]
pub(crate) enum DisposeAs {
    /// A known page of a paper.
    Known {
        #[arg(long)]
        paper: u32,
        #[arg(long)]
        page: u32,
    },
    /// An extra page for questions of a paper.
    Extra {
        #[arg(long)]
        paper: u32,
        #[arg(long, value_delimiter = ',', required = true)]
        questions: Vec<u32>,
    },
    /// Not part of any paper.
    Discard,
}

#[derive(Subcommand)]
pub(crate) enum TaskAction {
    /// List tasks.
    List {
        #[arg(long)]
        kind: Option<TaskKind>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        paper: Option<u32>,
        #[arg(long)]
        question: Option<u32>,
        #[arg(long)]
        assigned: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Claim the next available task.
    Next {
        #[arg(long, default_value = "mark")]
        kind: TaskKind,
    },
    /// Claim a specific task.
    Claim { id: TaskId },
    /// Give a leased task back.
    Release { id: TaskId },
    /// Release every task leased to the current user.
    ReleaseAll,
    /// Release leases older than `[tasks] lease_timeout_secs`.
    Expire,
    Tag { id: TaskId, tag: String },
    Untag { id: TaskId, tag: String },
    /// Lease a task to another user.
    Reassign { id: TaskId, user: String },
    /// Send a completed task back to the pool.
    Reset { id: TaskId },
    /// Retire a task's work and queue a replacement.
    Invalidate { id: TaskId },
    /// Submit a mark for a leased task.
    Mark {
        id: TaskId,
        #[arg(long)]
        token: String,
        #[arg(long)]
        score: f64,
        /// Seconds spent marking.
        #[arg(long, default_value_t = 0.0)]
        time: f64,
        /// Cited rubric as `<rid>@<revision>`; repeatable.
        #[arg(long = "rubric", value_parser = parse_rubric_ref)]
        rubrics: Vec<RubricRef>,
        /// Opaque annotation JSON.
        #[arg(long)]
        payload: Option<String>,
    },
    /// Submit a student identity for a leased identify task.
    Identify {
        id: TaskId,
        #[arg(long)]
        token: String,
        #[arg(long)]
        student_id: String,
        #[arg(long)]
        student_name: String,
    },
}

#[derive(Subcommand)]
pub(crate) enum RubricAction {
    /// Latest revision of every rubric.
    List {
        #[arg(long)]
        question: Option<u32>,
    },
    /// Every snapshot of one rubric.
    History { rid: RubricId },
    Create {
        #[arg(long)]
        question: u32,
        #[arg(long)]
        kind: RubricKind,
        #[arg(long, allow_negative_numbers = true)]
        value: f64,
        #[arg(long)]
        text: String,
        #[arg(long, value_delimiter = ',')]
        versions: Vec<u32>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        exclusive: bool,
    },
    /// Edit a rubric; `--major` starts a new revision.
    Revise {
        rid: RubricId,
        #[arg(long)]
        major: bool,
        #[arg(long)]
        kind: Option<RubricKind>,
        #[arg(long, allow_negative_numbers = true)]
        value: Option<f64>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long, value_delimiter = ',')]
        versions: Option<Vec<u32>>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        exclusive: Option<bool>,
    },
}

#[derive(Subcommand)]
pub(crate) enum UserAction {
    /// Set a user's task cap; omit `--limit` to remove it.
    Quota {
        user: String,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Replace a user's permitted questions (`q` or `q:v`); none means all.
    Permit {
        user: String,
        #[arg(value_parser = parse_permission)]
        allow: Vec<Permission>,
    },
    /// Show a user's quota and permissions.
    Show { user: String },
}

#[derive(Subcommand)]
pub(crate) enum PaperAction {
    Status { paper: u32 },
    /// Show advisory ID predictions.
    Predictions { paper: u32 },
    /// Record an advisory ID prediction.
    Predict {
        paper: u32,
        #[arg(long)]
        predictor: String,
        #[arg(long)]
        student_id: String,
        #[arg(long)]
        certainty: f64,
    },
}

fn parse_rubric_ref(s: &str) -> std::result::Result<RubricRef, String> {
    let (rid, revision) = s
        .split_once('@')
        .ok_or_else(|| format!("expected <rid>@<revision>, got {s:?}"))?;
    Ok(RubricRef {
        rid: rid.parse().map_err(|e| format!("bad rubric id {rid:?}: {e}"))?,
        revision: revision
            .parse()
            .map_err(|e| format!("bad revision {revision:?}: {e}"))?,
    })
}

fn parse_permission(s: &str) -> std::result::Result<Permission, String> {
    let (question, version) = match s.split_once(':') {
        Some((q, v)) => (q, Some(v)),
        None => (s, None),
    };
    Ok(Permission {
        question: question
            .parse()
            .map_err(|e| format!("bad question {question:?}: {e}"))?,
        version: version
            .map(|v| v.parse().map_err(|e| format!("bad version {v:?}: {e}")))
            .transpose()?,
    })
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "scanmark=info",
        1 => "scanmark=debug",
        _ => "scanmark=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Resolved config, open store and acting user.
struct Context {
    config: AppConfig,
    storage: Arc<Storage>,
    caller: Caller,
}

impl Context {
    fn tasks(&self) -> TaskEngine<'_> {
        TaskEngine::new(&self.storage, self.config.tasks.clone())
    }

    fn rubrics(&self) -> RubricLedger<'_> {
        RubricLedger::new(&self.storage, self.config.tasks.clone())
    }
}

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let command = match cli.command {
        Command::Config { action } => {
            return match action {
                ConfigAction::Init => cmd_config_init(),
                ConfigAction::Show => cmd_config_show(),
            };
        }
        other => other,
    };

    let config = load_config()?;
    let db = cli
        .db
        .unwrap_or_else(|| PathBuf::from(&config.defaults.database_path));
    let storage = Arc::new(Storage::open(&db).await?);
    let ctx = Context {
        config,
        storage,
        caller: Caller::new(cli.user, cli.role),
    };
    info!(db = %db.display(), user = %ctx.caller.username, role = %ctx.caller.role, "store opened");

    match command {
        Command::Config { .. } => Ok(()),
        Command::Layout { action } => match action {
            LayoutAction::Load { file } => cmd_layout_load(&ctx, &file).await,
            LayoutAction::Show => cmd_layout_show(&ctx).await,
        },
        Command::Pqv { action } => cmd_pqv(&ctx, action).await,
        Command::Bundle { action } => cmd_bundle(&ctx, action).await,
        Command::Page { action } => cmd_page(&ctx, action).await,
        Command::Task { action } => cmd_task(&ctx, action).await,
        Command::Rubric { action } => cmd_rubric(&ctx, action).await,
        Command::User { action } => cmd_user(&ctx, action).await,
        Command::Paper { action } => cmd_paper(&ctx, action).await,
    }
}

// ---------------------------------------------------------------------------
// Config and layout
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("cannot read {}", path.display()))
}

async fn cmd_layout_load(ctx: &Context, file: &Path) -> Result<()> {
    require_manager(&ctx.caller, "load the layout")?;
    let layout = AssessmentLayout::from_toml_str(&read_text(file)?)?;
    ctx.storage.load_layout(&layout).await?;
    println!(
        "  Layout {:?} loaded: {} pages, {} versions, {} questions",
        layout.name,
        layout.num_pages,
        layout.num_versions,
        layout.question_count()
    );
    Ok(())
}

async fn cmd_layout_show(ctx: &Context) -> Result<()> {
    let layout = ctx.storage.require_layout().await?;
    println!("{}", toml::to_string_pretty(&layout)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Version table
// ---------------------------------------------------------------------------

async fn cmd_pqv(ctx: &Context, action: PqvAction) -> Result<()> {
    let layout = ctx.storage.require_layout().await?;
    match action {
        PqvAction::Build { papers, seed } => {
            require_manager(&ctx.caller, "build the version table")?;
            let table = pqv::build(&layout, papers, seed.or(ctx.config.pqv.seed))?;
            let written = ctx.storage.commit_pqv(&table).await?;
            println!("  Version table committed: {written} rows");
        }
        PqvAction::Export { file } => {
            let table = ctx.storage.pqv_table().await?;
            std::fs::write(&file, pqv::to_csv(&layout, &table))
                .wrap_err_with(|| format!("cannot write {}", file.display()))?;
            println!("  Exported {} rows to {}", table.len(), file.display());
        }
        PqvAction::Import { file } => {
            require_manager(&ctx.caller, "import the version table")?;
            let table = pqv::from_csv(&layout, &read_text(&file)?)?;
            let written = ctx.storage.commit_pqv(&table).await?;
            println!("  Version table committed: {written} rows");
        }
        PqvAction::Append { template, papers } => {
            require_manager(&ctx.caller, "extend the version table")?;
            let current = ctx.storage.pqv_table().await?;
            let table = pqv::append(&current, &papers, template)?;
            let written = ctx.storage.commit_pqv(&table).await?;
            println!("  Added papers {papers:?} as copies of {template} ({written} rows written)");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Bundles and pages
// ---------------------------------------------------------------------------

/// Upload manifest. Relative paths resolve against the manifest's directory.
#[derive(Deserialize)]
struct Manifest {
    name: String,
    file: PathBuf,
    pages: Vec<ManifestPage>,
}

#[derive(Deserialize)]
struct ManifestPage {
    image: PathBuf,
    #[serde(default)]
    qr: Vec<String>,
}

fn read_bytes(base: &Path, path: &Path) -> Result<Vec<u8>> {
    let full = base.join(path);
    std::fs::read(&full).wrap_err_with(|| format!("cannot read {}", full.display()))
}

fn load_manifest(path: &Path) -> Result<BundleUpload> {
    let manifest: Manifest = serde_json::from_str(&read_text(path)?)
        .wrap_err_with(|| format!("invalid manifest {}", path.display()))?;
    let base = path.parent().unwrap_or(Path::new("."));
    let pages = manifest
        .pages
        .iter()
        .map(|page| {
            Ok(PageScan {
                image: read_bytes(base, &page.image)?,
                qr: page.qr.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(BundleUpload {
        name: manifest.name,
        file: read_bytes(base, &manifest.file)?,
        pages,
    })
}

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn page_classified(&self, order: u32, total: usize, kind: PageKind) {
        self.spinner
            .set_message(format!("Classifying [{order}/{total}] {kind}"));
    }

    fn done(&self, _summary: &BundleSummary) {
        self.spinner.finish_and_clear();
    }
}

fn print_summary(summary: &BundleSummary) {
    let bundle = &summary.bundle;
    println!("  Bundle:     {} ({})", bundle.name, bundle.id);
    println!("  Status:     {}", bundle.status);
    if let Some(error) = &bundle.error {
        println!("  Error:      {error}");
    }
    println!("  Pages:      {}", summary.total);
    println!("  Known:      {}", summary.known);
    println!("  Extra:      {} ({} unassigned)", summary.extra, summary.unassigned_extra);
    println!("  Unknown:    {}", summary.unknown);
    println!("  Collisions: {}", summary.collisions);
    println!("  Discarded:  {}", summary.discarded);
    println!(
        "  Pushable:   {}",
        if summary.is_ready_to_push() { "yes" } else { "no" }
    );
}

fn print_page(page: &ScannedPage) {
    println!(
        "  #{:<4} {}  {:?}",
        page.bundle_order, page.id, page.classification
    );
}

fn print_outcome(outcome: &ReviewOutcome) {
    if let Some(page) = &outcome.page {
        print_page(page);
    }
    println!("  Papers reassembled: {:?}", outcome.papers);
    for delta in &outcome.deltas {
        println!(
            "    {:<4} {:?} invalidated={} created={}",
            delta.kind.label(),
            delta.change,
            delta.invalidated.len(),
            delta
                .created
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string)
        );
    }
}

async fn cmd_bundle(ctx: &Context, action: BundleAction) -> Result<()> {
    match action {
        BundleAction::Upload { manifest } => {
            require_scanner(&ctx.caller, "upload bundles")?;
            let upload = load_manifest(&manifest)?;
            let ticket = ingest(
                Arc::clone(&ctx.storage),
                upload,
                &ctx.config.scanning,
                Arc::new(CliProgress::new()),
            )
            .await?;
            if ticket.continuation {
                println!("  Continuing bundle {}", ticket.bundle);
            }
            let summary = ticket
                .job
                .await
                .map_err(|e| eyre!("classification job aborted: {e}"))??;
            print_summary(&summary);
        }
        BundleAction::Status { id: Some(id) } => {
            print_summary(&ctx.storage.bundle_summary(&id).await?);
        }
        BundleAction::Status { id: None } => {
            for bundle in ctx.storage.list_bundles().await? {
                println!("  {}  {:<10} {}", bundle.id, bundle.status, bundle.name);
            }
        }
        BundleAction::Review { id } => {
            let pages = ctx.storage.pages_needing_review(&id).await?;
            if pages.is_empty() {
                println!("  Nothing to review.");
            }
            pages.iter().for_each(print_page);
        }
        BundleAction::Push { id } => {
            print_outcome(&review::push(&ctx.storage, &ctx.caller, &id).await?);
        }
    }
    Ok(())
}

async fn cmd_page(ctx: &Context, action: PageAction) -> Result<()> {
    let (storage, caller) = (&*ctx.storage, &ctx.caller);
    let outcome = match action {
        PageAction::Discard { image, reason } => {
            review::discard_page(storage, caller, &image, &reason).await?
        }
        PageAction::Resolve { image, keep } => {
            let keep = match keep {
                Keep::Incoming => CollisionKeep::Incoming,
                Keep::Existing => CollisionKeep::Existing,
            };
            review::resolve_collision(storage, caller, &image, keep).await?
        }
        PageAction::Assign {
            image,
            paper,
            questions,
        } => review::assign_extra(storage, caller, &image, paper, questions).await?,
        PageAction::Dispose { image, disposition } => {
            let disposition = match disposition {
                DisposeAs::Known { paper, page } => Disposition::Known { paper, page },
                DisposeAs::Extra { paper, questions } => Disposition::Extra { paper, questions },
                DisposeAs::Discard => Disposition::Discard,
            };
            review::dispose_unknown(storage, caller, &image, disposition).await?
        }
    };
    print_outcome(&outcome);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

fn print_tasks(tasks: &[Task]) {
    for task in tasks {
        println!(
            "  {}  {:<8} paper {:>4} {:<4} v{}  {:<11} {:<10} {}",
            task.id,
            task.kind,
            task.paper,
            task.group.label(),
            task.version,
            task.status,
            task.assigned_user.as_deref().unwrap_or("-"),
            task.tags.join(",")
        );
    }
    println!("  {} tasks", tasks.len());
}

async fn cmd_task(ctx: &Context, action: TaskAction) -> Result<()> {
    let engine = ctx.tasks();
    let caller = &ctx.caller;
    match action {
        TaskAction::List {
            kind,
            status,
            paper,
            question,
            assigned,
            tag,
        } => {
            let filter = TaskFilter {
                kind,
                status,
                paper,
                question,
                user: assigned,
                tag,
                ..Default::default()
            };
            print_tasks(&engine.list(&filter).await?);
        }
        TaskAction::Next { kind } => match engine.claim_next(caller, kind).await? {
            Some(lease) => {
                println!("  Claimed {}", lease.task);
                println!("  Token:  {}", lease.integrity_token);
            }
            None => println!("  No {kind} tasks available."),
        },
        TaskAction::Claim { id } => {
            let lease = engine.claim(caller, &id).await?;
            println!("  Claimed {}", lease.task);
            println!("  Token:  {}", lease.integrity_token);
        }
        TaskAction::Release { id } => {
            engine.release(caller, &id).await?;
            println!("  Released {id}");
        }
        TaskAction::ReleaseAll => {
            let released = engine.release_all(caller).await?;
            println!("  Released {} tasks", released.len());
        }
        TaskAction::Expire => {
            let released = engine.expire_leases(caller).await?;
            for id in &released {
                println!("  {id}");
            }
            println!("  Released {} expired leases", released.len());
        }
        TaskAction::Tag { id, tag } => engine.tag(caller, &id, &tag).await?,
        TaskAction::Untag { id, tag } => {
            if !engine.untag(caller, &id, &tag).await? {
                println!("  Task {id} was not tagged {tag:?}");
            }
        }
        TaskAction::Reassign { id, user } => {
            let lease = engine.reassign(caller, &id, &user).await?;
            println!("  {} now leased to {}", lease.task, lease.user);
        }
        TaskAction::Reset { id } => {
            let task = engine.reset(caller, &id).await?;
            println!("  {} is {}", task.id, task.status);
        }
        TaskAction::Invalidate { id } => match engine.invalidate(caller, &id).await? {
            Some(replacement) => println!("  {id} retired; replacement {replacement}"),
            None => println!("  {id} retired"),
        },
        TaskAction::Mark {
            id,
            token,
            score,
            time,
            rubrics,
            payload,
        } => {
            let payload = match payload {
                Some(text) => serde_json::from_str(&text).wrap_err("invalid --payload JSON")?,
                None => serde_json::Value::Null,
            };
            let submission = MarkSubmission {
                score,
                marking_time_secs: time,
                rubrics,
                payload,
            };
            let annotation = engine.complete_mark(caller, &id, &token, &submission).await?;
            println!(
                "  Paper {} Q{} marked {} (edition {})",
                annotation.paper, annotation.question, annotation.score, annotation.edition
            );
        }
        TaskAction::Identify {
            id,
            token,
            student_id,
            student_name,
        } => {
            let submission = IdentifySubmission {
                student_id,
                student_name,
            };
            let identity = engine
                .complete_identify(caller, &id, &token, &submission)
                .await?;
            println!(
                "  Paper {} identified as {} ({})",
                identity.paper, identity.student_id, identity.student_name
            );
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rubrics, users and papers
// ---------------------------------------------------------------------------

fn print_rubric(rubric: &Rubric) {
    let versions = if rubric.versions.is_empty() {
        "all".to_string()
    } else {
        format!("{:?}", rubric.versions)
    };
    println!(
        "  {} {}.{}  Q{} v{} {:<8} {:>5}  {}{}",
        rubric.rid,
        rubric.revision,
        rubric.subrevision,
        rubric.question,
        versions,
        rubric.kind,
        rubric.value,
        rubric.text,
        rubric
            .group
            .as_deref()
            .map(|g| format!("  [{g}{}]", if rubric.exclusive { ", exclusive" } else { "" }))
            .unwrap_or_default()
    );
}

async fn cmd_rubric(ctx: &Context, action: RubricAction) -> Result<()> {
    let ledger = ctx.rubrics();
    match action {
        RubricAction::List { question } => {
            ledger.list(question).await?.iter().for_each(print_rubric);
        }
        RubricAction::History { rid } => {
            ledger.history(&rid).await?.iter().for_each(print_rubric);
        }
        RubricAction::Create {
            question,
            kind,
            value,
            text,
            versions,
            group,
            exclusive,
        } => {
            let draft = RubricDraft {
                kind,
                value,
                text,
                question,
                versions,
                group,
                exclusive,
            };
            print_rubric(&ledger.create(&ctx.caller, draft).await?);
        }
        RubricAction::Revise {
            rid,
            major,
            kind,
            value,
            text,
            versions,
            group,
            exclusive,
        } => {
            let patch = RubricPatch {
                kind,
                value,
                text,
                versions,
                group,
                exclusive,
            };
            if major {
                let outcome = ledger.revise_major(&ctx.caller, &rid, &patch).await?;
                print_rubric(&outcome.rubric);
                println!(
                    "  Tagged {} completed tasks {:?}",
                    outcome.tagged.len(),
                    ctx.config.tasks.review_tag
                );
            } else {
                print_rubric(&ledger.revise_minor(&ctx.caller, &rid, &patch).await?);
            }
        }
    }
    Ok(())
}

async fn cmd_user(ctx: &Context, action: UserAction) -> Result<()> {
    let engine = ctx.tasks();
    match action {
        UserAction::Quota { user, limit } => {
            engine.set_quota(&ctx.caller, &user, limit).await?;
        }
        UserAction::Permit { user, allow } => {
            engine.set_permissions(&ctx.caller, &user, &allow).await?;
        }
        UserAction::Show { user } => {
            let quota = ctx.storage.quota(&user).await?;
            let permissions = ctx.storage.permissions(&user).await?;
            println!(
                "  Quota:       {}",
                quota.map_or_else(|| "default".to_string(), |q| q.to_string())
            );
            if permissions.is_empty() {
                println!("  Permissions: all questions");
            }
            for p in permissions {
                match p.version {
                    Some(v) => println!("  Permissions: Q{} v{v}", p.question),
                    None => println!("  Permissions: Q{} (all versions)", p.question),
                }
            }
        }
    }
    Ok(())
}

async fn cmd_paper(ctx: &Context, action: PaperAction) -> Result<()> {
    let engine = ctx.tasks();
    match action {
        PaperAction::Status { paper } => {
            let status = engine.paper_status(paper).await?;
            println!("  Paper {paper}");
            println!("  Unused:     {}", status.unused);
            println!("  Scanned:    {}", status.scanned);
            println!("  Identified: {}", status.identified);
            println!("  Marked:     {}", status.marked);
            if let Some(identity) = ctx.storage.paper_identity(paper).await? {
                println!("  Student:    {} ({})", identity.student_id, identity.student_name);
            }
        }
        PaperAction::Predictions { paper } => {
            for p in engine.predictions(paper).await? {
                println!("  {:<12} {}  {:.2}", p.predictor, p.student_id, p.certainty);
            }
        }
        PaperAction::Predict {
            paper,
            predictor,
            student_id,
            certainty,
        } => {
            let prediction = IdPrediction {
                paper,
                predictor,
                student_id,
                certainty,
                created_at: chrono::Utc::now(),
            };
            engine.record_prediction(&ctx.caller, &prediction).await?;
        }
    }
    Ok(())
}

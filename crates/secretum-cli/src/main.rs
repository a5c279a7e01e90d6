//! Secretum CLI - local secrets vault
//!
//! Usage:
//!   secretum init            - Create the master key and the vault database
//!   secretum add             - Store a new secret
//!   secretum list            - List stored secrets (nothing is decrypted)
//!   secretum show <id>       - Reveal a secret
//!   secretum copy <id>       - Copy a field to the clipboard for a bounded time

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use secretum_core::{RecordId, SensitiveField};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "secretum")]
#[command(version)]
#[command(about = "Local secrets vault with bounded clipboard exposure", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the master key, the vault database and a default config
    Init,

    /// Store a new secret (account and password are prompted)
    Add {
        #[arg(long)]
        title: String,

        /// work, wifi, education, private or else
        #[arg(long, default_value = "else")]
        category: String,

        /// Also prompt for a note
        #[arg(long)]
        note: bool,
    },

    /// List stored secrets, newest first
    List {
        #[arg(long)]
        category: Option<String>,
    },

    /// Search titles and categories
    Search { query: String },

    /// Reveal every field of a secret
    Show { id: RecordId },

    /// Copy one field to the clipboard; it is cleared after the exposure window
    Copy {
        id: RecordId,

        #[arg(long, value_enum, default_value_t = FieldArg::Password)]
        field: FieldArg,

        /// Stay in the foreground until the window has passed
        #[arg(long)]
        wait: bool,
    },

    /// Edit a secret; pass a field flag to re-enter that field
    Edit {
        id: RecordId,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        account: bool,

        #[arg(long)]
        password: bool,

        #[arg(long)]
        note: bool,
    },

    /// Delete a secret
    Delete {
        id: RecordId,

        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Run a pending clipboard clear handed over on stdin
    #[command(hide = true)]
    ClearClipboard,
}

#[derive(Clone, Copy, ValueEnum)]
enum FieldArg {
    Account,
    Password,
    Note,
}

impl From<FieldArg> for SensitiveField {
    fn from(field: FieldArg) -> Self {
        match field {
            FieldArg::Account => SensitiveField::Account,
            FieldArg::Password => SensitiveField::Password,
            FieldArg::Note => SensitiveField::Note,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => commands::init(),
        Commands::Add { title, category, note } => commands::add(&title, &category, note),
        Commands::List { category } => commands::list(category.as_deref()),
        Commands::Search { query } => commands::search(&query),
        Commands::Show { id } => commands::show(id),
        Commands::Copy { id, field, wait } => commands::copy(id, field.into(), wait).await,
        Commands::Edit {
            id,
            title,
            category,
            account,
            password,
            note,
        } => commands::edit(
            id,
            commands::EditRequest {
                title,
                category,
                account,
                password,
                note,
            },
        ),
        Commands::Delete { id, yes } => commands::delete(id, yes),
        Commands::ClearClipboard => commands::clear_clipboard().await,
    }
}

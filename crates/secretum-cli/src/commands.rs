//! Command handlers
//!
//! Every command builds its own `AppContext`. Reading the master key out of
//! the system keychain is the CLI's authentication step: the OS decides
//! whether this user may read it.

use anyhow::{bail, Context, Result};
use chrono::Local;
use secrecy::SecretString;
use secretum_core::{
    secretum_home, AppContext, RecordId, RevealedField, SecretDraft, SecretRecord, SecretType, SensitiveField,
    VaultConfig, VaultError,
};
use secretum_crypto::KeyringKeyStore;
use secretum_exposure::{
    DelayedTaskScheduler, DetachedJob, DetachedTimer, ExposeOutcome, SlotId, SlotRegistry, SystemClipboard,
    TokioTimer,
};
use secretum_store::SqliteRecordStore;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CLEAR_COMMAND: &str = "clear-clipboard";
const KEYCHAIN_LOCK: &str = "keychain.lock";

fn load_config() -> Result<VaultConfig> {
    VaultConfig::load().context("Failed to load configuration")
}

fn open_context(
    config: VaultConfig,
    slots: Arc<SlotRegistry>,
    timer: Arc<dyn DelayedTaskScheduler>,
) -> Result<AppContext> {
    let store = SqliteRecordStore::open(&config.database)
        .with_context(|| format!("Failed to open {}", config.database.display()))?;
    let keys = KeyringKeyStore::new(&config.service).with_lock_file(secretum_home()?.join(KEYCHAIN_LOCK));
    let keys = Arc::new(keys);
    Ok(AppContext::new(config, keys, Arc::new(store), slots, timer))
}

/// Context for commands that never touch the clipboard
fn open_without_clipboard(config: VaultConfig) -> Result<AppContext> {
    let slots = Arc::new(SlotRegistry::new());
    let timer = Arc::new(TokioTimer::new(slots.clone()));
    open_context(config, slots, timer)
}

fn unavailable(e: VaultError) -> anyhow::Error {
    if e.is_key_unavailable() {
        anyhow::anyhow!("Vault unavailable: {}. Check that the system keychain is unlocked.", e)
    } else {
        e.into()
    }
}

fn unlock(ctx: &AppContext) -> Result<()> {
    ctx.unlock(true).map_err(unavailable)?;
    Ok(())
}

fn prompt_secret(label: &str) -> Result<SecretString> {
    let value = rpassword::prompt_password(label).context("Failed to read from terminal")?;
    Ok(SecretString::new(value))
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn parse_category(raw: &str) -> SecretType {
    let category = SecretType::from_tag(raw);
    let explicit_else = ["else", "other"].iter().any(|t| raw.trim().eq_ignore_ascii_case(t));
    if category == SecretType::Else && !explicit_else {
        eprintln!("Unknown category '{}', filing under Other", raw);
    }
    category
}

fn render(field: &RevealedField) -> &str {
    match field {
        RevealedField::Value(_) => field.expose().unwrap_or_default(),
        RevealedField::Absent => "-",
        RevealedField::Corrupted => "<corrupted entry>",
    }
}

fn print_records(records: &[SecretRecord]) {
    if records.is_empty() {
        println!("No secrets found.");
        return;
    }

    for record in records {
        println!(
            "{:>5}  {:<10} {}  {}",
            record.id.unwrap_or_default(),
            record.category.label(),
            record.created_at.with_timezone(&Local).format("%Y-%m-%d"),
            record.title
        );
    }
}

pub fn init() -> Result<()> {
    let config = load_config()?;

    let home = secretum_home()?;
    let config_path = home.join("config.json");
    if !config_path.exists() {
        std::fs::create_dir_all(&home).with_context(|| format!("Failed to create {}", home.display()))?;
        let defaults = serde_json::to_string_pretty(&VaultConfig::default())?;
        std::fs::write(&config_path, defaults)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Wrote {}", config_path.display());
    }

    let algorithm = config.algorithm;
    let service = config.service.clone();
    let database = config.database.clone();

    let ctx = open_without_clipboard(config)?;
    ctx.ensure_key().map_err(unavailable)?;

    println!("Master key ready ({}) in keychain service '{}'", algorithm, service);
    println!("Vault database: {}", database.display());
    Ok(())
}

pub fn add(title: &str, category: &str, with_note: bool) -> Result<()> {
    if title.trim().is_empty() {
        bail!("Title must not be empty");
    }

    let category = parse_category(category);
    let ctx = open_without_clipboard(load_config()?)?;

    let account = prompt_secret("Account: ")?;
    let password = prompt_secret("Password: ")?;
    let mut draft = SecretDraft::new(title, category, account, password);
    if with_note {
        draft = draft.with_note(prompt_secret("Note: ")?);
    }

    let id = ctx.vault().add(&draft).map_err(unavailable)?;
    println!("Stored '{}' as #{}", draft.title, id);
    Ok(())
}

pub fn list(category: Option<&str>) -> Result<()> {
    let ctx = open_without_clipboard(load_config()?)?;
    let records = match category {
        Some(raw) => ctx.vault().by_category(parse_category(raw))?,
        None => ctx.vault().list()?,
    };
    print_records(&records);
    Ok(())
}

pub fn search(query: &str) -> Result<()> {
    let ctx = open_without_clipboard(load_config()?)?;
    print_records(&ctx.vault().search(query)?);
    Ok(())
}

pub fn show(id: RecordId) -> Result<()> {
    let ctx = open_without_clipboard(load_config()?)?;
    unlock(&ctx)?;

    let secret = ctx.reveal(id).map_err(unavailable)?;
    println!("{}", secret.title);
    println!("  Category: {}", secret.category);
    println!("  Created:  {}", secret.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M"));
    println!("  Account:  {}", render(&secret.account));
    println!("  Password: {}", render(&secret.password));
    println!("  Note:     {}", render(&secret.note));

    if !secret.is_intact() {
        eprintln!("Warning: some fields could not be decrypted. The entry may be corrupted or was sealed under another key.");
    }
    ctx.lock();
    Ok(())
}

fn detached_timer(config: &VaultConfig) -> DetachedTimer {
    let args = vec![CLEAR_COMMAND.to_string()];
    DetachedTimer::current_exe(args.clone(), config.state_dir()).unwrap_or_else(|e| {
        warn!(error = %e, "Using secretum from PATH for clipboard clears");
        DetachedTimer::new("secretum", args, config.state_dir())
    })
}

pub async fn copy(id: RecordId, field: SensitiveField, wait: bool) -> Result<()> {
    let config = load_config()?;
    let window = config.clear_after();

    let clipboard = SystemClipboard::detect().context("No clipboard available")?;
    let slots = Arc::new(SlotRegistry::new().with_slot(SlotId::clipboard(), Arc::new(clipboard)));
    let timer: Arc<dyn DelayedTaskScheduler> = if wait {
        Arc::new(TokioTimer::new(slots.clone()))
    } else {
        Arc::new(detached_timer(&config))
    };

    let ctx = open_context(config, slots, timer)?;
    unlock(&ctx)?;

    let title = ctx.vault().get(id)?.title;
    let outcome = ctx.copy_field(id, field).map_err(unavailable)?;
    ctx.lock();

    match outcome {
        ExposeOutcome::Guarded { deadline } => {
            println!("Copied {} of '{}'. Clipboard clears in {}s.", field, title, window.as_secs());
            if wait {
                tokio::time::sleep_until(deadline).await;
                while ctx.exposure().is_pending(&SlotId::clipboard()) {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                println!("Exposure window over.");
            }
        }
        ExposeOutcome::Unguarded(e) => {
            eprintln!("Copied {} of '{}', but it will NOT be cleared automatically: {}", field, title, e);
            eprintln!("Clear the clipboard yourself when done.");
        }
    }
    Ok(())
}

pub struct EditRequest {
    pub title: Option<String>,
    pub category: Option<String>,
    pub account: bool,
    pub password: bool,
    pub note: bool,
}

fn keep(field: &RevealedField, name: &str) -> Result<SecretString> {
    match field {
        RevealedField::Corrupted => bail!("The stored {} is corrupted; re-enter it with --{}", name, name),
        other => Ok(SecretString::new(other.expose().unwrap_or_default().to_string())),
    }
}

pub fn edit(id: RecordId, request: EditRequest) -> Result<()> {
    let ctx = open_without_clipboard(load_config()?)?;
    unlock(&ctx)?;

    let record = ctx.vault().get(id)?;
    let current = ctx.vault().reveal(&record).map_err(unavailable)?;

    let account = if request.account {
        prompt_secret("New account: ")?
    } else {
        keep(&current.account, "account")?
    };
    let password = if request.password {
        prompt_secret("New password: ")?
    } else {
        keep(&current.password, "password")?
    };
    let note = if request.note {
        Some(prompt_secret("New note (empty to remove): ")?)
    } else {
        match &current.note {
            RevealedField::Absent => None,
            other => Some(keep(other, "note")?),
        }
    };
    drop(current);

    let title = request.title.unwrap_or(record.title);
    let category = request.category.as_deref().map(parse_category).unwrap_or(record.category);

    let mut draft = SecretDraft::new(&title, category, account, password);
    if let Some(note) = note {
        draft = draft.with_note(note);
    }
    if draft.title.is_empty() {
        bail!("Title must not be empty");
    }

    ctx.vault().update(id, &draft).map_err(unavailable)?;
    ctx.lock();
    println!("Updated #{}", id);
    Ok(())
}

pub fn delete(id: RecordId, yes: bool) -> Result<()> {
    let ctx = open_without_clipboard(load_config()?)?;
    let record = ctx.vault().get(id)?;

    if !yes && !confirm(&format!("Delete '{}'?", record.title))? {
        println!("Kept.");
        return Ok(());
    }

    ctx.vault().delete(id)?;
    println!("Deleted '{}'", record.title);
    Ok(())
}

/// Helper side of `DetachedTimer`: read the job, sleep, clear if still
/// current.
pub async fn clear_clipboard() -> Result<()> {
    let job = DetachedJob::read_from(std::io::stdin().lock())?;
    let clipboard = SystemClipboard::detect()?;
    let registry = SlotRegistry::new().with_slot(SlotId::clipboard(), Arc::new(clipboard));

    let slot = job.slot().clone();
    let outcome = tokio::task::spawn_blocking(move || job.run(&registry))
        .await
        .context("Clear task panicked")??;
    info!(slot = %slot, ?outcome, "Detached clear finished");
    Ok(())
}

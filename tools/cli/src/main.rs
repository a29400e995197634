//! Credvault CLI - Command line interface for the credential vault.
//!
//! This tool provides a command-line interface for storing, browsing,
//! and rotating passphrase-protected credentials.

mod config;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use credvault_common::ItemId;
use credvault_crypto::{generate_password, PasswordPolicy, DEFAULT_PASSWORD_LENGTH};
use credvault_storage::{KvStore, SqliteStore, HEADER_KEY};
use credvault_vault::{
    export_file, import_file, CredentialPayload, DecryptedItem, ImportMode, RekeyMonitor,
    RekeyProgress, VaultOptions, VaultSession,
};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "credvault")]
#[command(about = "Credvault - Passphrase-protected credential store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Vault database path (overrides the config file).
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// PBKDF2 iterations for a new vault (overrides the config file).
    #[arg(long, global = true)]
    iterations: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

/// Options for generating an entry password instead of prompting.
#[derive(Args, Debug, Clone)]
struct GenerateArgs {
    /// Generate a random password.
    #[arg(short, long)]
    generate: bool,

    /// Generated password length.
    #[arg(long, default_value_t = DEFAULT_PASSWORD_LENGTH, requires = "generate")]
    length: usize,

    /// Letters and digits only.
    #[arg(long, requires = "generate")]
    no_symbols: bool,

    /// Allow look-alike characters such as 0/O and 1/l.
    #[arg(long, requires = "generate")]
    allow_ambiguous: bool,
}

impl GenerateArgs {
    fn policy(&self) -> PasswordPolicy {
        PasswordPolicy {
            length: self.length,
            symbols: !self.no_symbols,
            avoid_ambiguous: !self.allow_ambiguous,
            ..PasswordPolicy::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new vault.
    Init,

    /// Add a credential. The password is prompted for unless generated.
    Add {
        /// Entry name (also its id).
        #[arg(short, long)]
        name: String,

        /// Account name.
        #[arg(short, long, default_value = "")]
        username: String,

        /// Site URL.
        #[arg(long)]
        url: Option<String>,

        /// Tag; repeat for several.
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Free-form notes.
        #[arg(long)]
        notes: Option<String>,

        #[command(flatten)]
        generate: GenerateArgs,
    },

    /// List credentials.
    List {
        /// Only entries with this tag.
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// Show one credential.
    Show {
        /// Entry name.
        name: String,

        /// Print the password.
        #[arg(short, long)]
        reveal: bool,
    },

    /// Edit a credential. Unset options keep their current value.
    Edit {
        /// Entry name.
        name: String,

        /// Rename the entry.
        #[arg(long)]
        rename: Option<String>,

        /// New account name.
        #[arg(short, long)]
        username: Option<String>,

        /// New URL; empty clears it.
        #[arg(long)]
        url: Option<String>,

        /// Replace tags; repeat for several.
        #[arg(short, long = "tag")]
        tags: Option<Vec<String>>,

        /// New notes; empty clears them.
        #[arg(long)]
        notes: Option<String>,

        /// Prompt for a new password.
        #[arg(short, long, conflicts_with = "generate")]
        password: bool,

        #[command(flatten)]
        generate: GenerateArgs,
    },

    /// Remove a credential.
    Remove {
        /// Entry name.
        name: String,
    },

    /// List all tags.
    Tags,

    /// Change the vault passphrase and re-encrypt every entry.
    ChangePassphrase,

    /// Export all entries to a vault file (plaintext entries).
    Export {
        /// Output file.
        path: PathBuf,
    },

    /// Import entries from a vault file.
    Import {
        /// Input file.
        path: PathBuf,

        /// Remove all existing entries first.
        #[arg(long)]
        replace: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        let mut command = Cli::command();
        clap_complete::generate(shell, &mut command, "credvault", &mut std::io::stdout());
        return Ok(());
    }

    let config = CliConfig::load()?;
    let store_path = config.store_path(cli.store)?;
    let options = config.options(cli.iterations)?;

    match cli.command {
        Commands::Init => cmd_init(&store_path, options).await,

        Commands::Add {
            name,
            username,
            url,
            tags,
            notes,
            generate,
        } => {
            let mut payload = CredentialPayload::new(name, username, String::new()).with_tags(tags);
            payload.url = url;
            payload.notes = notes;
            cmd_add(&store_path, options, payload, &generate).await
        }

        Commands::List { tag } => cmd_list(&store_path, options, tag.as_deref()).await,

        Commands::Show { name, reveal } => cmd_show(&store_path, options, &name, reveal).await,

        Commands::Edit {
            name,
            rename,
            username,
            url,
            tags,
            notes,
            password,
            generate,
        } => {
            let edits = Edits {
                rename,
                username,
                url,
                tags,
                notes,
                password,
                generate,
            };
            cmd_edit(&store_path, options, &name, edits).await
        }

        Commands::Remove { name } => cmd_remove(&store_path, options, &name).await,

        Commands::Tags => cmd_tags(&store_path, options).await,

        Commands::ChangePassphrase => cmd_change_passphrase(&store_path, options).await,

        Commands::Export { path } => cmd_export(&store_path, options, &path).await,

        Commands::Import { path, replace } => {
            let mode = if replace {
                ImportMode::Replace
            } else {
                ImportMode::Merge
            };
            cmd_import(&store_path, options, &path, mode).await
        }

        Commands::Completions { .. } => Ok(()),
    }
}

/// Prompt for a passphrase without echo.
fn prompt_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    let passphrase = rpassword::prompt_password(prompt).context("Failed to read passphrase")?;
    Ok(Zeroizing::new(passphrase))
}

/// Prompt twice and require both entries to match.
fn prompt_new_passphrase(prompt: &str) -> Result<Zeroizing<String>> {
    let passphrase = prompt_passphrase(prompt)?;
    let confirm = prompt_passphrase("Confirm passphrase: ")?;

    if *passphrase != *confirm {
        anyhow::bail!("Passphrases do not match");
    }
    if passphrase.is_empty() {
        anyhow::bail!("Passphrase cannot be empty");
    }
    Ok(passphrase)
}

/// Generate an entry password, or prompt for one.
fn entry_password(generate: &GenerateArgs, prompt: &str) -> Result<Zeroizing<String>> {
    if !generate.generate {
        return prompt_passphrase(prompt);
    }
    let password =
        generate_password(&generate.policy()).context("Failed to generate password")?;
    println!(
        "Generated a {}-character password; use `credvault show --reveal` to view it.",
        password.chars().count()
    );
    Ok(password)
}

fn open_store(path: &Path) -> Result<Arc<dyn KvStore>> {
    let store = SqliteStore::open(path)
        .with_context(|| format!("Failed to open vault at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Open the store and unlock it with a prompted passphrase.
async fn open_session(path: &Path, options: VaultOptions) -> Result<VaultSession> {
    unlock_store(open_store(path)?, path, options).await
}

async fn unlock_store(
    store: Arc<dyn KvStore>,
    path: &Path,
    options: VaultOptions,
) -> Result<VaultSession> {
    if store.get_meta(HEADER_KEY).await?.is_none() {
        anyhow::bail!(
            "No vault at {}; run `credvault init` first",
            path.display()
        );
    }

    let passphrase = prompt_passphrase("Passphrase: ")?;
    let mut session = VaultSession::new(store, options);
    session
        .unlock(&passphrase)
        .await
        .context("Failed to unlock vault")?;
    Ok(session)
}

fn item_id(name: &str) -> Result<ItemId> {
    ItemId::new(name.trim()).context("Invalid entry name")
}

fn print_item(entry: &DecryptedItem, reveal: bool) {
    let payload = &entry.payload;
    println!("{}", payload.name);
    if !payload.username.is_empty() {
        println!("  Username: {}", payload.username);
    }
    if reveal {
        println!("  Password: {}", payload.password);
    }
    if let Some(url) = &payload.url {
        println!("  URL: {}", url);
    }
    if !payload.tags.is_empty() {
        println!("  Tags: {}", payload.tags.join(", "));
    }
    if let Some(notes) = &payload.notes {
        println!("  Notes: {}", notes);
    }
    println!("  Created: {}", entry.item.created_at.to_rfc3339());
    println!("  Updated: {}", entry.item.updated_at.to_rfc3339());
}

/// Create a new vault.
async fn cmd_init(path: &Path, options: VaultOptions) -> Result<()> {
    info!("Creating new vault at: {}", path.display());

    let store = open_store(path)?;
    if store.get_meta(HEADER_KEY).await?.is_some() {
        anyhow::bail!("A vault already exists at {}", path.display());
    }

    let passphrase = prompt_new_passphrase("New passphrase: ")?;
    let iterations = options.iterations;
    let mut session = VaultSession::new(store, options);
    session
        .unlock(&passphrase)
        .await
        .context("Failed to create vault")?;
    session.lock();

    println!("Vault created successfully!");
    println!("  Location: {}", path.display());
    println!("  KDF: PBKDF2-HMAC-SHA256, {} iterations", iterations);

    Ok(())
}

/// Add a credential.
async fn cmd_add(
    path: &Path,
    options: VaultOptions,
    mut payload: CredentialPayload,
    generate: &GenerateArgs,
) -> Result<()> {
    let mut session = open_session(path, options).await?;

    let password = entry_password(generate, "Entry password: ")?;
    payload.password = password.to_string();

    let item = session
        .create_item(&payload)
        .await
        .context("Failed to add entry")?;
    session.lock();

    println!("Entry added: {}", item.id);
    Ok(())
}

/// List credentials.
async fn cmd_list(path: &Path, options: VaultOptions, tag: Option<&str>) -> Result<()> {
    let mut session = open_session(path, options).await?;

    let items = match tag {
        Some(tag) => session.items_with_tag(tag).await,
        None => session.list_items().await,
    }
    .context("Failed to list entries")?;
    session.lock();

    if items.is_empty() {
        println!("No entries.");
    } else {
        for entry in &items {
            let username = &entry.payload.username;
            let tags = entry.payload.tags.join(", ");
            println!("  {}  {}  [{}]", entry.payload.name, username, tags);
        }
    }

    Ok(())
}

/// Show one credential.
async fn cmd_show(path: &Path, options: VaultOptions, name: &str, reveal: bool) -> Result<()> {
    let mut session = open_session(path, options).await?;

    let entry = session
        .get_item(&item_id(name)?)
        .await
        .context("Failed to read entry")?;
    session.lock();

    print_item(&entry, reveal);
    Ok(())
}

struct Edits {
    rename: Option<String>,
    username: Option<String>,
    url: Option<String>,
    tags: Option<Vec<String>>,
    notes: Option<String>,
    password: bool,
    generate: GenerateArgs,
}

/// Edit a credential.
async fn cmd_edit(path: &Path, options: VaultOptions, name: &str, edits: Edits) -> Result<()> {
    let mut session = open_session(path, options).await?;
    let id = item_id(name)?;

    let mut payload = session
        .get_item(&id)
        .await
        .context("Failed to read entry")?
        .payload;

    if let Some(rename) = edits.rename {
        payload.name = rename;
    }
    if let Some(username) = edits.username {
        payload.username = username;
    }
    if let Some(url) = edits.url {
        payload.url = Some(url);
    }
    if let Some(tags) = edits.tags {
        payload.tags = tags;
    }
    if let Some(notes) = edits.notes {
        payload.notes = Some(notes);
    }
    if edits.password || edits.generate.generate {
        payload.password = entry_password(&edits.generate, "New entry password: ")?.to_string();
    }

    let item = session
        .update_item(&id, &payload)
        .await
        .context("Failed to update entry")?;
    session.lock();

    println!("Entry updated: {}", item.id);
    Ok(())
}

/// Remove a credential.
async fn cmd_remove(path: &Path, options: VaultOptions, name: &str) -> Result<()> {
    let store = open_store(path)?;
    let mut session = VaultSession::new(store, options);

    session
        .delete_item(&item_id(name)?)
        .await
        .context("Failed to remove entry")?;

    println!("Entry removed: {}", name.trim());
    Ok(())
}

/// List all tags.
async fn cmd_tags(path: &Path, options: VaultOptions) -> Result<()> {
    let mut session = open_session(path, options).await?;
    let tags: Vec<String> = session.tags().into_iter().map(str::to_string).collect();
    session.lock();

    if tags.is_empty() {
        println!("No tags.");
    } else {
        for tag in tags {
            println!("  {}", tag);
        }
    }
    Ok(())
}

/// Change the vault passphrase.
async fn cmd_change_passphrase(path: &Path, options: VaultOptions) -> Result<()> {
    info!("Changing vault passphrase");

    let iterations = options.iterations;
    let mut session = open_session(path, options).await?;
    let new_passphrase = prompt_new_passphrase("New passphrase: ")?;

    let mut monitor = RekeyMonitor::new();
    let mut report = |event: &RekeyProgress| {
        monitor.observe(event);
        let mut stderr = std::io::stderr();
        let _ = write!(
            stderr,
            "\r{:<24} {:>5}/{:<5} {:>3}%",
            monitor.message().unwrap_or_default(),
            monitor.done(),
            monitor.total(),
            monitor.percent()
        );
        let _ = stderr.flush();
    };

    let count = session
        .change_passphrase(None, &new_passphrase, Some(iterations), &mut report)
        .await;
    eprintln!();
    let count = count.context("Failed to change passphrase")?;
    session.lock();

    println!("Passphrase changed; {} entries re-encrypted.", count);
    Ok(())
}

/// Export to a vault file.
async fn cmd_export(path: &Path, options: VaultOptions, output: &Path) -> Result<()> {
    let mut session = open_session(path, options).await?;

    let count = export_file(&session, output, None)
        .await
        .context("Failed to export vault")?;
    session.lock();

    println!("Exported {} entries to {}", count, output.display());
    println!("Warning: the file contains plaintext credentials.");
    Ok(())
}

/// Import from a vault file.
async fn cmd_import(path: &Path, options: VaultOptions, input: &Path, mode: ImportMode) -> Result<()> {
    let store = open_store(path)?;
    let initialized = store.get_meta(HEADER_KEY).await?.is_some();

    let mut session = if initialized {
        unlock_store(store, path, options).await?
    } else {
        VaultSession::new(store, options)
    };

    let passphrase = prompt_passphrase("File passphrase: ")?;
    let summary = import_file(&mut session, input, &passphrase, mode)
        .await
        .context("Failed to import vault file")?;
    session.lock();

    println!("Imported {} entries ({:?}).", summary.imported, summary.mode);
    if summary.restored {
        println!("The vault passphrase is now the file passphrase.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_generate_options() {
        let cli = Cli::try_parse_from([
            "credvault", "add", "--name", "mail", "--generate", "--length", "32", "--no-symbols",
        ])
        .unwrap();
        let Commands::Add { generate, .. } = cli.command else {
            panic!("expected add");
        };
        let policy = generate.policy();
        assert_eq!(policy.length, 32);
        assert!(!policy.symbols);
        assert!(policy.avoid_ambiguous);
    }

    #[test]
    fn test_generate_options_require_generate() {
        assert!(Cli::try_parse_from(["credvault", "add", "--name", "mail", "--length", "8"]).is_err());
    }

    #[test]
    fn test_edit_password_conflicts_with_generate() {
        assert!(
            Cli::try_parse_from(["credvault", "edit", "mail", "--password", "--generate"]).is_err()
        );
        assert!(Cli::try_parse_from(["credvault", "edit", "mail", "--generate"]).is_ok());
    }
}

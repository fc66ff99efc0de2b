use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use url::Url;
use workcopy_core::{WorkingCopyIdentity, UNTITLED_SCHEME};
use workcopy_engine::{
    CreateUntitledOptions, RevertOptions, SaveAsCoordinator, SaveAsOptions, SaveOptions,
    WorkingCopy, WorkingCopyBackupTracker, WorkingCopyRegistry,
};

use crate::dialogs::{read_line, Input};

/// Type id of every working copy the session opens.
pub const TEXT: &str = "text";

const USAGE: &str = "\
commands:
  open <path>                  open a file
  show <doc>                   print the content
  edit <doc> <text>            replace the content
  append <doc> <text>          append a line
  save <doc>                   save (untitled documents ask for a target)
  save-as <doc> [path]         save under a new path
  revert <doc>                 discard unsaved changes
  new [text]                   create an untitled document
  move <path> <path>           move a file with its open documents
  list                         list open documents and unrestored backups
  restore                      open every unrestored backup
  quit                         shut down";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open(String),
    Show(String),
    Edit(String, String),
    Append(String, String),
    Save(String),
    SaveAs(String, Option<String>),
    Revert(String),
    New(Option<String>),
    Move(String, String),
    List,
    Restore,
    Help,
    Quit,
}

/// Parse one input line. Blank lines parse to `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (name, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let mut args = rest.splitn(2, ' ');
    let first = args.next().filter(|s| !s.is_empty()).map(str::to_string);
    let second = args.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    let need = |arg: Option<String>| arg.ok_or_else(|| format!("{}: missing argument\n{}", name, USAGE));

    let command = match name {
        "open" => Command::Open(need(first)?),
        "show" => Command::Show(need(first)?),
        "edit" => Command::Edit(need(first)?, second.unwrap_or_default()),
        "append" => Command::Append(need(first)?, need(second)?),
        "save" => Command::Save(need(first)?),
        "save-as" => Command::SaveAs(need(first)?, second),
        "revert" => Command::Revert(need(first)?),
        "new" => Command::New(if rest.is_empty() { None } else { Some(rest.to_string()) }),
        "move" => Command::Move(need(first)?, need(second)?),
        "list" | "ls" => Command::List,
        "restore" => Command::Restore,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {}\n{}", other, USAGE)),
    };
    Ok(Some(command))
}

/// Why the session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Quit,
    Signal,
    EndOfInput,
}

/// Line-oriented driver over the registry, save-as and the backup tracker.
pub struct Session {
    registry: Arc<WorkingCopyRegistry>,
    save_as: Arc<SaveAsCoordinator>,
    tracker: Arc<WorkingCopyBackupTracker>,
    input: Input,
    cwd: PathBuf,
}

impl Session {
    pub fn new(
        registry: Arc<WorkingCopyRegistry>,
        save_as: Arc<SaveAsCoordinator>,
        tracker: Arc<WorkingCopyBackupTracker>,
        input: Input,
        cwd: PathBuf,
    ) -> Self {
        Self {
            registry,
            save_as,
            tracker,
            input,
            cwd,
        }
    }

    /// Read and execute commands until `quit`, end of input or `shutdown`.
    pub async fn run<F: Future<Output = ()>>(&self, shutdown: F) -> Exit {
        tokio::pin!(shutdown);
        loop {
            let line = tokio::select! {
                line = read_line(&self.input, "> ") => line,
                _ = &mut shutdown => return Exit::Signal,
            };
            let Some(line) = line else {
                return Exit::EndOfInput;
            };

            match parse_command(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => return Exit::Quit,
                Ok(Some(command)) => match self.execute(command).await {
                    Ok(output) if output.is_empty() => {}
                    Ok(output) => println!("{}", output),
                    Err(e) => println!("error: {:#}", e),
                },
                Err(usage) => println!("{}", usage),
            }
        }
    }

    /// Execute one command and return what to print.
    pub async fn execute(&self, command: Command) -> anyhow::Result<String> {
        match command {
            Command::Open(target) => {
                let copy = self.open(&target).await?;
                Ok(describe(&copy))
            }
            Command::Show(target) => {
                let copy = self.open(&target).await?;
                Ok(String::from_utf8_lossy(&copy.content()).into_owned())
            }
            Command::Edit(target, text) => {
                let copy = self.open(&target).await?;
                copy.set_content(text)?;
                Ok(describe(&copy))
            }
            Command::Append(target, text) => {
                let copy = self.open(&target).await?;
                let mut content = copy.content();
                if !content.is_empty() && !content.ends_with(b"\n") {
                    content.push(b'\n');
                }
                content.extend_from_slice(text.as_bytes());
                copy.set_content(content)?;
                Ok(describe(&copy))
            }
            Command::Save(target) => {
                let copy = self.known(&target)?;
                if copy.is_untitled() {
                    return self.save_as_target(copy.resource(), None).await;
                }
                if copy.save(SaveOptions::default()).await? {
                    Ok(format!("Saved {}", copy.name()))
                } else {
                    Ok(format!("{} has no unsaved changes", copy.name()))
                }
            }
            Command::SaveAs(source, target) => {
                let source = self.known(&source)?.resource().clone();
                let target = target.map(|t| self.target_url(&t)).transpose()?;
                self.save_as_target(&source, target.as_ref()).await
            }
            Command::Revert(target) => {
                let copy = self.known(&target)?;
                copy.revert(RevertOptions::default()).await?;
                Ok(format!("Reverted {}", copy.name()))
            }
            Command::New(text) => {
                let copy = self
                    .registry
                    .create_untitled(
                        TEXT,
                        CreateUntitledOptions {
                            associated_path: None,
                            initial_value: text.map(String::into_bytes),
                        },
                    )
                    .await?;
                Ok(describe(&copy))
            }
            Command::Move(source, target) => {
                let source = self.target_url(&source)?;
                let target = self.target_url(&target)?;
                self.registry.move_resource(&source, &target).await?;
                Ok(format!("Moved to {}", target))
            }
            Command::List => Ok(self.list()),
            Command::Restore => {
                let restored = self.tracker.restore_backups().await;
                let names: Vec<String> = restored.iter().map(|copy| describe(copy)).collect();
                Ok(format!("Restored {} backup(s)\n{}", names.len(), names.join("\n"))
                    .trim_end()
                    .to_string())
            }
            Command::Help => Ok(USAGE.to_string()),
            Command::Quit => Ok(String::new()),
        }
    }

    async fn save_as_target(&self, source: &Url, target: Option<&Url>) -> anyhow::Result<String> {
        match self.save_as.save_as(source, target, SaveAsOptions::default()).await? {
            Some(copy) => Ok(format!("Saved as {}", copy.resource())),
            None => Ok("Save as cancelled".to_string()),
        }
    }

    fn list(&self) -> String {
        let mut lines: Vec<String> = self
            .registry
            .working_copies()
            .iter()
            .map(|copy| {
                format!(
                    "{} {}",
                    if copy.is_dirty() { "*" } else { " " },
                    copy.resource()
                )
            })
            .collect();
        lines.extend(
            self.tracker
                .unrestored_backups()
                .into_iter()
                .map(|identity| format!("~ {} (backup)", identity.resource)),
        );
        if lines.is_empty() {
            "No open documents".to_string()
        } else {
            lines.join("\n")
        }
    }

    /// Resolve `target` through the registry.
    async fn open(&self, target: &str) -> anyhow::Result<Arc<WorkingCopy>> {
        let identity = WorkingCopyIdentity::new(TEXT, self.target_url(target)?);
        Ok(self.registry.resolve(&identity, Default::default()).await?)
    }

    /// An already open working copy.
    fn known(&self, target: &str) -> anyhow::Result<Arc<WorkingCopy>> {
        let identity = WorkingCopyIdentity::new(TEXT, self.target_url(target)?);
        self.registry
            .get(&identity)
            .ok_or_else(|| anyhow!("{} is not open", target))
    }

    fn target_url(&self, target: &str) -> anyhow::Result<Url> {
        if target.starts_with("Untitled-") {
            return Ok(Url::parse(&format!("{}:{}", UNTITLED_SCHEME, target))?);
        }
        if target.contains("://") || target.starts_with(&format!("{}:", UNTITLED_SCHEME)) {
            return Url::parse(target).with_context(|| format!("invalid URI {}", target));
        }
        Url::from_file_path(self.cwd.join(target))
            .map_err(|_| anyhow!("invalid path {}", target))
    }
}

fn describe(copy: &WorkingCopy) -> String {
    format!(
        "{}{} ({} bytes)",
        copy.name(),
        if copy.is_dirty() { " *" } else { "" },
        copy.content().len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogs::{stdin_input, LogProgress, TerminalDialogs};
    use pretty_assertions::assert_eq;
    use workcopy_core::memory::{MemoryBackupStore, MemoryStorage};
    use workcopy_core::{ConfirmResult, StaticShutdownHost, WorkbenchState};
    use workcopy_engine::{SaveAsConfig, TrackerConfig, TrackerServices};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        backups: Arc<MemoryBackupStore>,
        session: Session,
    }

    fn setup() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let backups = Arc::new(MemoryBackupStore::new());
        let registry = WorkingCopyRegistry::new(storage.clone(), backups.clone());
        let input = stdin_input();
        let dialogs = Arc::new(TerminalDialogs::new(
            input.clone(),
            Some(ConfirmResult::Save),
            PathBuf::from("/work"),
        ));
        let save_as = Arc::new(SaveAsCoordinator::new(
            TEXT,
            registry.clone(),
            dialogs.clone(),
            SaveAsConfig {
                default_save_dir: Some(url("file:///work/")),
            },
        ));
        let tracker = WorkingCopyBackupTracker::new(
            TrackerServices {
                registry: registry.clone(),
                backups: backups.clone(),
                dialogs,
                progress: Arc::new(LogProgress::default()),
                host: Arc::new(StaticShutdownHost::new(1, WorkbenchState::Folder)),
                save_as: Some(save_as.clone()),
            },
            TrackerConfig {
                backup_delay: std::time::Duration::from_secs(60),
                ..Default::default()
            },
        );
        let session = Session::new(registry, save_as, tracker, input, PathBuf::from("/work"));
        Fixture {
            storage,
            backups,
            session,
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("  "), Ok(None));
        assert_eq!(
            parse_command("edit a.txt hello world"),
            Ok(Some(Command::Edit("a.txt".to_string(), "hello world".to_string())))
        );
        assert_eq!(
            parse_command("save-as Untitled-1"),
            Ok(Some(Command::SaveAs("Untitled-1".to_string(), None)))
        );
        assert_eq!(parse_command("new"), Ok(Some(Command::New(None))));
        assert_eq!(
            parse_command("new some text"),
            Ok(Some(Command::New(Some("some text".to_string()))))
        );
        assert_eq!(parse_command("quit"), Ok(Some(Command::Quit)));
        assert!(parse_command("open").is_err());
        assert!(parse_command("frobnicate x").is_err());
    }

    #[tokio::test]
    async fn test_edit_and_save() {
        let f = setup();
        f.storage.insert(&url("file:///work/a.txt"), "old");

        let opened = f.session.execute(Command::Open("a.txt".into())).await.unwrap();
        assert_eq!(opened, "a.txt (3 bytes)");

        f.session
            .execute(Command::Edit("a.txt".into(), "new".into()))
            .await
            .unwrap();
        assert!(f.session.list().starts_with("* file:///work/a.txt"));

        let saved = f.session.execute(Command::Save("a.txt".into())).await.unwrap();
        assert_eq!(saved, "Saved a.txt");
        assert_eq!(
            f.storage.content(&url("file:///work/a.txt")),
            Some(b"new".to_vec())
        );
    }

    #[tokio::test]
    async fn test_untitled_save_uses_suggested_target() {
        let f = setup();
        f.session
            .execute(Command::New(Some("draft".into())))
            .await
            .unwrap();

        let saved = f
            .session
            .execute(Command::Save("Untitled-1".into()))
            .await
            .unwrap();

        assert_eq!(saved, "Saved as file:///work/Untitled-1");
        assert_eq!(
            f.storage.content(&url("file:///work/Untitled-1")),
            Some(b"draft".to_vec())
        );
    }

    #[tokio::test]
    async fn test_save_of_unknown_document_fails() {
        let f = setup();
        let err = f
            .session
            .execute(Command::Save("missing.txt".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing.txt is not open");
    }

    #[tokio::test]
    async fn test_restore_lists_backups() {
        let f = setup();
        let identity = WorkingCopyIdentity::new(TEXT, url("untitled:Untitled-7"));
        f.backups.insert(&identity, "recovered", 1);
        f.session.tracker.start().await.unwrap();

        assert_eq!(f.session.list(), "~ untitled:Untitled-7 (backup)");
        let restored = f.session.execute(Command::Restore).await.unwrap();

        assert_eq!(restored, "Restored 1 backup(s)\nUntitled-7 * (9 bytes)");
        assert!(f.session.tracker.unrestored_backups().is_empty());
    }
}

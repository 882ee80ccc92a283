use std::fs::{self, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::Editor;

use securefs_core::layout;

#[derive(Parser)]
#[clap(name = "securefs-shell", about = "Interactive REPL against a securefs mount")]
struct Cli {
    /// Backing directory of the mount (used to find the session file).
    backing: PathBuf,
    /// Where the filesystem is mounted.
    mountpoint: PathBuf,
}

/// In-memory client state: a virtual current directory, relative to the
/// mount root, with no leading `/`.
struct Shell {
    mountpoint: PathBuf,
    backing: PathBuf,
    session_path: PathBuf,
    cwd: PathBuf,
    user: String,
}

impl Shell {
    fn new(mountpoint: PathBuf, backing: &Path) -> Self {
        // Picks up a `USER=` line from a `.env` in the working directory, the
        // same bootstrap the original client used before session files.
        dotenvy::dotenv().ok();
        let session_path = layout::session_path(backing);
        let user = std::fs::read_to_string(&session_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            mountpoint,
            backing: backing.to_path_buf(),
            session_path,
            cwd: PathBuf::new(),
            user,
        }
    }

    fn prompt(&self) -> String {
        let display = if self.cwd.as_os_str().is_empty() {
            "/".to_string()
        } else {
            format!("/{}", self.cwd.display())
        };
        format!("{}@{}{}$ ", self.user, self.mountpoint.display(), display)
    }

    /// Resolve user input to a path relative to the mount root. Absolute
    /// (leading `/`) inputs resolve from the root; everything else resolves
    /// from `self.cwd`. A resolution that normalizes outside the root is
    /// rejected client-side, in addition to whatever the mediator itself
    /// would do with it.
    fn resolve(&self, input: &str) -> Option<PathBuf> {
        let base = if let Some(stripped) = input.strip_prefix('/') {
            Path::new(stripped).to_path_buf()
        } else {
            self.cwd.join(input)
        };

        let mut normalized = PathBuf::new();
        for component in base.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::ParentDir => {
                    if !normalized.pop() {
                        eprintln!("[warning] path escapes the mount root, blocked client-side");
                        return None;
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Some(normalized)
    }

    fn real_path(&self, virtual_path: &Path) -> PathBuf {
        self.mountpoint.join(virtual_path)
    }

    fn ls(&self) {
        let target = self.real_path(&self.cwd);
        match fs::read_dir(&target) {
            Ok(entries) => {
                let mut names: Vec<_> = entries.flatten().collect();
                names.sort_by_key(|e| e.file_name());
                for entry in names {
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    let name = entry.file_name().to_string_lossy().to_string();
                    if is_dir {
                        println!("  [DIR]  {name}/");
                    } else {
                        println!("  [FILE] {name}");
                    }
                }
            }
            Err(err) => println!("[error] cannot list {}: {err}", target.display()),
        }
    }

    fn cd(&mut self, arg: &str) {
        let Some(candidate) = self.resolve(arg) else {
            return;
        };
        let target = self.real_path(&candidate);
        if !target.is_dir() {
            println!("[error] not a directory: {arg}");
            return;
        }
        self.cwd = candidate;
    }

    fn cat(&self, arg: &str) {
        let Some(candidate) = self.resolve(arg) else {
            return;
        };
        match fs::read_to_string(self.real_path(&candidate)) {
            Ok(content) => {
                println!("--------------------");
                print!("{content}");
                println!("--------------------");
            }
            Err(err) => println!("[error] cannot read {arg}: {err}"),
        }
    }

    fn write(&self, editor: &mut Editor<()>, arg: &str, append: bool) {
        let Some(candidate) = self.resolve(arg) else {
            return;
        };
        let content = match editor.readline("content> ") {
            Ok(line) => line,
            Err(_) => return,
        };
        let real_path = self.real_path(&candidate);
        let opened = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!append)
            .append(append)
            .open(&real_path);
        match opened {
            Ok(mut file) => {
                if let Err(err) = writeln!(file, "{content}") {
                    println!("[error] write failed: {err}");
                } else {
                    println!("wrote to {}", candidate.display());
                }
            }
            Err(err) => println!("[error] cannot open {arg}: {err}"),
        }
    }

    fn rm(&self, arg: &str) {
        let Some(candidate) = self.resolve(arg) else {
            return;
        };
        let real_path = self.real_path(&candidate);
        if real_path.is_dir() {
            println!("[error] {arg} is a directory, use an admin tool to remove directories");
            return;
        }
        match fs::remove_file(&real_path) {
            Ok(()) => println!("removed {}", candidate.display()),
            Err(err) => println!("[error] cannot remove {arg}: {err}"),
        }
    }

    fn login(&mut self, user: &str) -> Result<()> {
        if let Some(parent) = self.session_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.session_path, format!("{user}\n"))
            .with_context(|| format!("writing session file {}", self.session_path.display()))?;
        self.user = user.to_string();
        self.cwd = PathBuf::new();
        println!("logged in as {user}");
        Ok(())
    }

    fn settrust(&self, user: &str, trusted: &str) {
        let status = std::process::Command::new("securefs-admin")
            .arg(&self.backing)
            .arg("set-trust")
            .arg(user)
            .arg(trusted)
            .status();
        match status {
            Ok(status) if status.success() => println!("trust updated for {user}"),
            Ok(status) => println!("[error] securefs-admin exited with {status}"),
            Err(err) => println!("[error] could not run securefs-admin: {err}"),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    let mut shell = Shell::new(cli.mountpoint, &cli.backing);

    let mut editor = Editor::<()>::new().context("initializing line editor")?;
    loop {
        let prompt = shell.prompt();
        match editor.readline(&prompt) {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let mut parts = line.split_whitespace();
                let command = parts.next().unwrap_or_default();
                let args: Vec<&str> = parts.collect();

                match command {
                    "ls" => shell.ls(),
                    "cd" => match args.first() {
                        Some(arg) => shell.cd(arg),
                        None => println!("usage: cd <path>"),
                    },
                    "cat" => match args.first() {
                        Some(arg) => shell.cat(arg),
                        None => println!("usage: cat <path>"),
                    },
                    "new" => match args.first() {
                        Some(arg) => shell.write(&mut editor, arg, false),
                        None => println!("usage: new <path>"),
                    },
                    "add" => match args.first() {
                        Some(arg) => shell.write(&mut editor, arg, true),
                        None => println!("usage: add <path>"),
                    },
                    "rm" => match args.first() {
                        Some(arg) => shell.rm(arg),
                        None => println!("usage: rm <path>"),
                    },
                    "pwd" => println!("{}", shell.prompt().trim_end_matches("$ ")),
                    "login" => match args.first() {
                        Some(user) => {
                            if let Err(err) = shell.login(user) {
                                println!("[error] {err:#}");
                            }
                        }
                        None => println!("usage: login <user>"),
                    },
                    "settrust" => match (args.first(), args.get(1)) {
                        (Some(user), Some(trusted)) => shell.settrust(user, trusted),
                        _ => println!("usage: settrust <user> <true|false>"),
                    },
                    "exit" => break,
                    other => println!("unknown command: {other}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("[error] {err}");
                break;
            }
        }
    }
    Ok(())
}

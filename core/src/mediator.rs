//! The mediated filesystem: a `fuser::Filesystem` implementation that runs
//! every kernel callback through principal resolution, label inference, and
//! the policy engine before touching the backing directory (spec 4.4).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write as IoWrite};
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request,
};

use crate::audit::{AuditRecord, AuditSink};
use crate::error::{DenyReason, MediatorError, Result};
use crate::label::{label_of, Sensitivity};
use crate::policy::{decide, is_visible_without_annotation, Decision, Intent, Operation};
use crate::principal::{Principal, PrincipalResolver};

const ROOT_INO: u64 = 1;
const TTL: Duration = Duration::from_secs(1);
const EXPURGATE_MARKER: &str = "[EXPURGATED]\n";

/// A kernel-assigned inode maps to a virtual path (relative to the mount
/// root, with no leading `/`). The table grows as `lookup`/`readdir`/
/// `mkdir`/`create` discover paths; it never shrinks except on `forget`,
/// which this filesystem does not bother tracking since the backing tree is
/// the source of truth and re-lookup is cheap.
#[derive(Default)]
struct InodeTable {
    paths: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_INO, PathBuf::new());
        let mut by_path = HashMap::new();
        by_path.insert(PathBuf::new(), ROOT_INO);
        Self {
            paths,
            by_path,
            next: ROOT_INO + 1,
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.paths.get(&ino).cloned()
    }

    fn intern(&mut self, path: PathBuf) -> u64 {
        if let Some(ino) = self.by_path.get(&path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_path.insert(path.clone(), ino);
        self.paths.insert(ino, path);
        ino
    }
}

struct OpenHandle {
    file: File,
    append: bool,
    /// The virtual path this handle was opened against, carried along so
    /// `read`/`write` can audit against the real path instead of a synthetic
    /// handle label (spec 4.4: per-call audit records on a live handle).
    path: PathBuf,
}

/// Open file/directory handles, keyed by an incrementing `u64` the kernel
/// carries on every subsequent `read`/`write`/`release`.
#[derive(Default)]
struct HandleTable {
    files: HashMap<u64, OpenHandle>,
    next_fh: AtomicU64,
}

impl HandleTable {
    fn insert(&mut self, file: File, append: bool, path: PathBuf) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst) + 1;
        self.files.insert(fh, OpenHandle { file, append, path });
        fh
    }

    fn remove(&mut self, fh: u64) -> Option<OpenHandle> {
        self.files.remove(&fh)
    }
}

/// The reference monitor itself. Constructed once per mount; `&self` methods
/// on `fuser::Filesystem` are satisfied by interior mutability on the inode
/// and handle tables, which exist only because the trait demands `&self` /
/// `&mut self` - not because of real cross-thread contention (spec 5: the
/// mount runs single-threaded).
pub struct Mediator {
    root: PathBuf,
    resolver: PrincipalResolver,
    audit: AuditSink,
    inodes: Mutex<InodeTable>,
    handles: Mutex<HandleTable>,
}

impl Mediator {
    pub fn new(root: PathBuf, resolver: PrincipalResolver, audit: AuditSink) -> Self {
        Self {
            root,
            resolver,
            audit,
            inodes: Mutex::new(InodeTable::new()),
            handles: Mutex::new(HandleTable::default()),
        }
    }

    fn principal(&self) -> Principal {
        self.resolver.current_principal()
    }

    /// Translate a virtual path (relative, no leading `/`) to the backing
    /// path, rejecting any normalization that escapes the root.
    fn real_path(&self, virtual_path: &Path) -> Result<PathBuf> {
        let mut normalized = PathBuf::new();
        for component in virtual_path.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(MediatorError::Denied(DenyReason::PathEscape));
                    }
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Ok(self.root.join(normalized))
    }

    fn emit(&self, principal: &Principal, operation: Operation, path: &Path, decision: Decision) {
        let record = AuditRecord::from_decision(
            &principal.name,
            principal.clearance,
            operation,
            path,
            decision,
        );
        if let Err(err) = self.audit.record(&record) {
            tracing::error!(error = %err, "audit sink write failed");
        }
    }

    /// Run the common "resolve label, ask policy, audit" skeleton every
    /// entry point shares. Returns the decision so callers can act on a
    /// `GrantAsDowngrade`.
    fn authorize(
        &self,
        principal: &Principal,
        operation: Operation,
        virtual_path: &Path,
        intent: Intent,
    ) -> Decision {
        let label = label_of(virtual_path);
        let decision = decide(principal, operation, label, intent);
        self.emit(principal, operation, virtual_path, decision);
        decision
    }

    fn path_for_ino(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.lock().unwrap().path_of(ino)
    }

    fn attr_from_metadata(ino: u64, metadata: &fs::Metadata) -> FileAttr {
        let kind = if metadata.is_dir() {
            FileType::Directory
        } else if metadata.is_symlink() {
            FileType::Symlink
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino,
            size: metadata.len(),
            blocks: (metadata.len() + 511) / 512,
            atime: metadata.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH + Duration::from_secs(metadata.ctime().max(0) as u64),
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: (metadata.mode() & 0o7777) as u16,
            nlink: metadata.nlink() as u32,
            uid: metadata.uid(),
            gid: metadata.gid(),
            rdev: metadata.rdev() as u32,
            blksize: 4096,
            flags: 0,
        }
    }

    /// The non-kernel extension operation: downgrade `source` into `dest`,
    /// crash-safely (write to a temp file in the destination's parent, then
    /// rename into place), per spec 4.4 and the atomicity note in spec 9.
    pub fn expurgate(&self, source: &Path, dest: &Path) -> Result<()> {
        let principal = self.principal();
        let source_real = self.real_path(source)?;
        let dest_real = self.real_path(dest)?;

        let source_label = label_of(source);
        let dest_label = label_of(dest);
        let decision = decide(
            &principal,
            Operation::Expurgate,
            source_label,
            Intent::expurgate_to(dest_label),
        );
        self.emit(&principal, Operation::Expurgate, source, decision);
        if !decision.is_grant() {
            return Err(MediatorError::Denied(match decision {
                Decision::Deny(reason) => reason,
                _ => unreachable!(),
            }));
        }

        let mut content = Vec::new();
        File::open(&source_real)?.read_to_end(&mut content)?;

        let parent = dest_real
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)?;
        let tmp_path = parent.join(format!(
            ".expurgate-{}.tmp",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default()
        ));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(EXPURGATE_MARKER.as_bytes())?;
            tmp.write_all(&content)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &dest_real)?;
        Ok(())
    }
}

impl Filesystem for Mediator {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = parent_path.join(name);
        let principal = self.principal();
        self.authorize(&principal, Operation::GetAttr, &virtual_path, Intent::none());

        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        match fs::symlink_metadata(&real_path) {
            Ok(metadata) => {
                let ino = self.inodes.lock().unwrap().intern(virtual_path);
                reply.entry(&TTL, &Self::attr_from_metadata(ino, &metadata), 0);
            }
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(virtual_path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let principal = self.principal();
        self.authorize(&principal, Operation::GetAttr, &virtual_path, Intent::none());

        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        match fs::symlink_metadata(&real_path) {
            Ok(metadata) => reply.attr(&TTL, &Self::attr_from_metadata(ino, &metadata)),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(virtual_path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let principal = self.principal();

        // A size change truncates or extends content: gated like any other
        // write. Mode/owner changes are metadata, ungated, same as getattr.
        if size.is_some() {
            let decision =
                self.authorize(&principal, Operation::OpenWrite, &virtual_path, Intent::none());
            if !decision.is_grant() {
                reply.error(libc::EACCES);
                return;
            }
        }

        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        if let Some(size) = size {
            if let Err(err) = OpenOptions::new().write(true).open(&real_path).and_then(|f| f.set_len(size)) {
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        }
        if let Some(mode) = mode {
            let _ = fs::set_permissions(&real_path, fs::Permissions::from_mode(mode));
        }
        let _ = (uid, gid); // chown requires privileges the mount process may lack; best-effort only.

        match fs::symlink_metadata(&real_path) {
            Ok(metadata) => reply.attr(&TTL, &Self::attr_from_metadata(ino, &metadata)),
            Err(_) => reply.error(libc::ENOENT),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(virtual_path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let principal = self.principal();
        let wants_write = mask & libc::W_OK != 0;
        let op = if wants_write {
            Operation::OpenWrite
        } else {
            Operation::Access
        };
        let decision = self.authorize(&principal, op, &virtual_path, Intent::none());
        if decision.is_grant() {
            reply.ok();
        } else {
            reply.error(libc::EACCES);
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(virtual_path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let principal = self.principal();
        self.authorize(&principal, Operation::ReadDir, &virtual_path, Intent::none());
        reply.opened(0, 0);
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(virtual_path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let principal = self.principal();
        self.authorize(&principal, Operation::ReadDir, &virtual_path, Intent::none());

        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        let entries = match fs::read_dir(&real_path) {
            Ok(entries) => entries,
            Err(_) => {
                reply.error(libc::ENOENT);
                return;
            }
        };

        let mut listing: Vec<(PathBuf, String, FileType)> = vec![
            (virtual_path.clone(), ".".to_string(), FileType::Directory),
            (
                virtual_path.parent().map(Path::to_path_buf).unwrap_or_default(),
                "..".to_string(),
                FileType::Directory,
            ),
        ];
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let child_virtual = virtual_path.join(&name);
            let kind = match entry.file_type() {
                Ok(ft) if ft.is_dir() => FileType::Directory,
                Ok(ft) if ft.is_symlink() => FileType::Symlink,
                _ => FileType::RegularFile,
            };
            let entry_label = label_of(&child_virtual);
            if !is_visible_without_annotation(&principal, entry_label) {
                // Still listed (write-up needs a named target) but annotated
                // in the audit trail as a higher-than-clearance entry.
                let record = AuditRecord {
                    user: principal.name.clone(),
                    clearance: principal.clearance,
                    operation: Operation::ReadDir,
                    path: child_virtual.clone(),
                    outcome: "GRANTED".to_string(),
                    extra: Some(format!("listed above clearance ({entry_label})")),
                };
                if let Err(err) = self.audit.record(&record) {
                    tracing::error!(error = %err, "audit sink write failed");
                }
            }
            listing.push((child_virtual, name, kind));
        }

        for (index, (_path, name, kind)) in listing.into_iter().enumerate().skip(offset as usize) {
            let ino = self.inodes.lock().unwrap().intern(_path);
            let next_offset = (index + 1) as i64;
            if reply.add(ino, next_offset, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = parent_path.join(name);
        let principal = self.principal();
        let decision = self.authorize(&principal, Operation::Create, &virtual_path, Intent::none());
        if !decision.is_grant() {
            reply.error(libc::EACCES);
            return;
        }

        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        if let Err(err) = fs::create_dir(&real_path) {
            reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let _ = fs::set_permissions(&real_path, fs::Permissions::from_mode(mode));

        match fs::symlink_metadata(&real_path) {
            Ok(metadata) => {
                let ino = self.inodes.lock().unwrap().intern(virtual_path);
                reply.entry(&TTL, &Self::attr_from_metadata(ino, &metadata), 0);
            }
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = parent_path.join(name);
        let principal = self.principal();
        let decision = self.authorize(&principal, Operation::Unlink, &virtual_path, Intent::none());
        if !decision.is_grant() {
            reply.error(libc::EACCES);
            return;
        }
        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        match fs::remove_dir(&real_path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = parent_path.join(name);
        let principal = self.principal();
        let decision = self.authorize(&principal, Operation::Unlink, &virtual_path, Intent::none());
        if !decision.is_grant() {
            reply.error(libc::EACCES);
            return;
        }
        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        match fs::remove_file(&real_path) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(match err.kind() {
                std::io::ErrorKind::NotFound => libc::ENOENT,
                _ => err.raw_os_error().unwrap_or(libc::EIO),
            }),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(virtual_path) = self.path_for_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let principal = self.principal();

        let access_mode = flags & libc::O_ACCMODE;
        let append = flags & libc::O_APPEND != 0;
        let operation = match access_mode {
            libc::O_RDONLY => Operation::OpenRead,
            libc::O_WRONLY if append => Operation::OpenAppend,
            libc::O_WRONLY => Operation::OpenWrite,
            libc::O_RDWR => Operation::OpenReadWrite,
            _ => Operation::OpenRead,
        };
        let decision = self.authorize(&principal, operation, &virtual_path, Intent::none());
        if !decision.is_grant() {
            reply.error(libc::EACCES);
            return;
        }

        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        let mut options = OpenOptions::new();
        match access_mode {
            libc::O_RDONLY => {
                options.read(true);
            }
            libc::O_WRONLY => {
                options.write(true).append(append);
            }
            libc::O_RDWR => {
                options.read(true).write(true).append(append);
            }
            _ => {
                options.read(true);
            }
        }
        match options.open(&real_path) {
            Ok(file) => {
                let fh = self.handles.lock().unwrap().insert(file, append, virtual_path);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(match err.kind() {
                std::io::ErrorKind::NotFound => libc::ENOENT,
                _ => err.raw_os_error().unwrap_or(libc::EIO),
            }),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(parent_path) = self.path_for_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let virtual_path = parent_path.join(name);
        let principal = self.principal();
        let decision = self.authorize(&principal, Operation::Create, &virtual_path, Intent::none());
        if !decision.is_grant() {
            reply.error(libc::EACCES);
            return;
        }

        let real_path = match self.real_path(&virtual_path) {
            Ok(path) => path,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        let append = flags & libc::O_APPEND != 0;
        let opened = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .append(append)
            .open(&real_path);
        let file = match opened {
            Ok(file) => file,
            Err(err) => {
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };
        let _ = fs::set_permissions(&real_path, fs::Permissions::from_mode(mode));
        let metadata = match fs::symlink_metadata(&real_path) {
            Ok(metadata) => metadata,
            Err(_) => {
                reply.error(libc::EIO);
                return;
            }
        };
        let ino = self.inodes.lock().unwrap().intern(virtual_path.clone());
        let fh = self.handles.lock().unwrap().insert(file, append, virtual_path);
        reply.created(&TTL, &Self::attr_from_metadata(ino, &metadata), 0, fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // The per-open check already happened in `open`; reads only need to
        // be logged, per spec 4.4 ("they do not re-evaluate policy, but they
        // do emit audit records per call").
        let principal = self.principal();
        let mut handles = self.handles.lock().unwrap();
        let Some(handle) = handles.files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match handle.file.read_at(&mut buf, offset.max(0) as u64) {
            Ok(read) => {
                buf.truncate(read);
                self.emit(&principal, Operation::OpenRead, &handle.path, Decision::Grant);
                reply.data(&buf);
            }
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let principal = self.principal();
        let mut handles = self.handles.lock().unwrap();
        let Some(handle) = handles.files.get_mut(&fh) else {
            reply.error(libc::EBADF);
            return;
        };

        // Append mode must never honor a caller-provided offset that would
        // overwrite existing content (spec 4.4).
        let result = if handle.append {
            handle
                .file
                .seek(SeekFrom::End(0))
                .and_then(|_| handle.file.write(data))
        } else {
            handle.file.write_at(data, offset.max(0) as u64).map(|n| n)
        };

        match result {
            Ok(written) => {
                self.emit(&principal, Operation::OpenWrite, &handle.path, Decision::Grant);
                reply.written(written as u32);
            }
            Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let handles = self.handles.lock().unwrap();
        if let Some(handle) = handles.files.get(&fh) {
            let _ = handle.file.sync_data();
        }
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.lock().unwrap().remove(fh);
        reply.ok();
    }
}

// 远程目录镜像上传
use crate::ssh::transport::RemoteFs;
use crate::utils::error::{FleetError, Result};
use crate::utils::file::{base_name, relative_remote, remote_join};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Span};

/// Recursive file and directory transfer over a session's file-transfer channel.
pub struct RemoteFileMirror<'a> {
    fs: &'a dyn RemoteFs,
    chunk_size: usize,
    span: Span,
}

impl<'a> RemoteFileMirror<'a> {
    pub fn new(fs: &'a dyn RemoteFs, chunk_size: usize, span: Span) -> Self {
        Self { fs, chunk_size, span }
    }

    /// 任何 IO 错误都按“不是目录”处理
    pub fn is_directory(&self, path: &str) -> bool {
        self.fs.is_dir(path).unwrap_or(false)
    }

    /// Removes `path` and everything below it. A path that is not a
    /// directory is left alone.
    pub fn remove_recursive(&self, path: &str) -> Result<()> {
        let _guard = self.span.enter();
        if !self.is_directory(path) {
            warn!("\"{}\" is not a directory on SFTP server", path);
            return Ok(());
        }
        self.remove_tree(path)
    }

    fn remove_tree(&self, path: &str) -> Result<()> {
        let entries = self
            .fs
            .list_dir(path)
            .map_err(|e| FleetError::remote_fs("list", path, e))?;

        for name in entries {
            let entry = remote_join(path, &name);
            if self.is_directory(&entry) {
                self.remove_tree(&entry)?;
            } else {
                self.fs
                    .remove_file(&entry)
                    .map_err(|e| FleetError::remote_fs("remove", &entry, e))?;
            }
        }

        self.fs
            .remove_dir(path)
            .map_err(|e| FleetError::remote_fs("rmdir", path, e))?;
        debug!(path, "Removed remote directory");
        Ok(())
    }

    /// Copies one file. When `dest_is_dir` is set the remote name is the
    /// local file's base name inside `remote_dest`.
    pub fn upload_file(&self, local_file: &Path, remote_dest: &str, dest_is_dir: bool) -> Result<String> {
        let target = if dest_is_dir {
            remote_join(remote_dest, &base_name(local_file)?)
        } else {
            remote_dest.to_string()
        };
        let bytes = self
            .fs
            .put(local_file, &target, self.chunk_size)
            .map_err(|e| FleetError::remote_fs("put", &target, e))?;
        let _guard = self.span.enter();
        debug!(local = %local_file.display(), remote = %target, bytes, "Uploaded file");
        Ok(target)
    }

    /// Mirrors a local directory to `remote_dir`.
    ///
    /// The destination root, and every destination subdirectory, is wiped
    /// and recreated before files are copied into it, so nothing from an
    /// earlier upload of the same tree survives. With `include_root` the
    /// destination root is `remote_dir/<local dir name>`.
    pub fn upload_tree(&self, local_dir: &Path, remote_dir: &str, include_root: bool) -> Result<String> {
        if !local_dir.is_dir() {
            return Err(FleetError::NotADirectory {
                path: local_dir.display().to_string(),
            });
        }

        let root = if include_root {
            remote_join(remote_dir, &base_name(local_dir)?)
        } else {
            remote_dir.to_string()
        };

        {
            let _guard = self.span.enter();
            info!("Mirroring {} -> {}", local_dir.display(), root);
        }

        self.recreate_dir(&root)?;
        let mut files = 0usize;
        let mut pending: Vec<PathBuf> = vec![local_dir.to_path_buf()];

        // 先序遍历：父目录总在子目录之前重建
        while let Some(dir) = pending.pop() {
            let dest = match relative_remote(local_dir, &dir) {
                Some(rel) if rel.is_empty() => root.clone(),
                Some(rel) => {
                    let dest = remote_join(&root, &rel);
                    self.recreate_dir(&dest)?;
                    dest
                }
                None => continue,
            };

            let mut subdirs = Vec::new();
            let mut entries: Vec<_> = fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let path = entry.path();
                // file_type 不跟随符号链接
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    subdirs.push(path);
                } else if file_type.is_file() {
                    self.upload_file(&path, &dest, true)?;
                    files += 1;
                } else {
                    let _guard = self.span.enter();
                    warn!("Skipping {} (not a regular file or directory)", path.display());
                }
            }
            // 逆序入栈，保持按名称顺序处理
            pending.extend(subdirs.into_iter().rev());
        }

        let _guard = self.span.enter();
        info!(files, "Mirror upload to {} finished", root);
        Ok(root)
    }

    fn recreate_dir(&self, path: &str) -> Result<()> {
        if self.is_directory(path) {
            self.remove_tree(path)?;
        }
        self.fs
            .mkdir(path)
            .map_err(|e| FleetError::remote_fs("mkdir", path, e))
    }
}

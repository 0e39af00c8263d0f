//! Gitolite `keydir` management.
//!
//! Keys are written to a temporary file inside the keydir, then renamed over
//! `<username>.pub`. A reader of the final path sees either the previous key
//! or the new one, never a truncated file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;

const KEY_EXTENSION: &str = "pub";
const TEMP_SUFFIX: &str = ".tmp";
#[cfg(unix)]
const KEY_MODE: u32 = 0o644;

// Same rule gitolite applies to user names.
static USERNAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9A-Za-z][-0-9A-Za-z._@+]*$").expect("valid username regex")
});

/// Error related to key files.
#[derive(Debug, thiserror::Error)]
pub enum KeyDirError {
    #[error("`{0}` is not a valid username")]
    InvalidUsername(String),
    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key writer panicked or was cancelled: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl KeyDirError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Check `username` can be used as a file name inside the keydir.
pub fn validate_username(username: &str) -> Result<(), KeyDirError> {
    // `..` cannot match since the first char must be alphanumeric.
    if USERNAME.is_match(username) {
        Ok(())
    } else {
        Err(KeyDirError::InvalidUsername(username.to_owned()))
    }
}

/// Directory holding one `<username>.pub` file per user.
#[derive(Debug, Clone)]
pub struct KeyDir {
    root: PathBuf,
}

impl KeyDir {
    /// Create a new [`KeyDir`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Warn early when the directory cannot receive keys.
    pub fn check(&self) -> bool {
        match std::fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => true,
            Ok(_) => {
                tracing::warn!(path = %self.root.display(), "keydir is not a directory");
                false
            },
            Err(err) => {
                tracing::warn!(path = %self.root.display(), error = %err, "keydir is not accessible");
                false
            },
        }
    }

    /// Final location of the key of `username`.
    pub fn path_for(&self, username: &str) -> Result<PathBuf, KeyDirError> {
        validate_username(username)?;
        Ok(self.root.join(format!("{username}.{KEY_EXTENSION}")))
    }

    /// Atomically replace the key of `username` with `ssh_key`.
    pub fn materialize(
        &self,
        username: &str,
        ssh_key: &str,
    ) -> Result<PathBuf, KeyDirError> {
        let path = self.path_for(username)?;

        // not ending in `.pub`, so gitolite ignores it.
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{username}."))
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&self.root)
            .map_err(|err| KeyDirError::io(&self.root, err))?;

        temp.write_all(ssh_key.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| KeyDirError::io(temp.path(), err))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(KEY_MODE))
                .map_err(|err| KeyDirError::io(temp.path(), err))?;
        }

        // on failure the temporary file is dropped, hence removed.
        temp.persist(&path)
            .map_err(|err| KeyDirError::io(&path, err.error))?;
        sync_dir(&self.root)?;

        tracing::debug!(path = %path.display(), "key file replaced");

        Ok(path)
    }

    /// [`KeyDir::materialize`] on the blocking thread pool.
    pub async fn materialize_async(
        &self,
        username: &str,
        ssh_key: &str,
    ) -> Result<PathBuf, KeyDirError> {
        let keydir = self.clone();
        let username = username.to_owned();
        let ssh_key = ssh_key.to_owned();

        tokio::task::spawn_blocking(move || keydir.materialize(&username, &ssh_key)).await?
    }
}

/// Flush `dir` entries, so that a rename inside it survives a crash.
fn sync_dir(dir: &Path) -> Result<(), KeyDirError> {
    #[cfg(unix)]
    std::fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|err| KeyDirError::io(dir, err))?;

    #[cfg(not(unix))]
    let _ = dir;

    Ok(())
}

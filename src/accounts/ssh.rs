use crate::error::{Error, Result};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::info;

/// `authorized_keys` of `user`, below `root_dir` (normally "/")
pub fn authorized_keys_path(root_dir: &Path, user: &str) -> PathBuf {
    let home = match user {
        "root" => root_dir.join("root"),
        _ => root_dir.join("home").join(user),
    };
    home.join(".ssh").join("authorized_keys")
}

/// One trimmed key per line, first occurrence wins, trailing newline
pub fn render_authorized_keys<S: AsRef<str>>(keys: &[S]) -> String {
    let mut seen: Vec<&str> = Vec::new();
    for key in keys.iter().map(|k| k.as_ref().trim()) {
        if !key.is_empty() && !seen.contains(&key) {
            seen.push(key);
        }
    }
    format!("{}\n", seen.join("\n"))
}

/// Replace the user's authorized keys with `keys`
pub fn authorize_ssh_keys<S: AsRef<str>>(
    root_dir: &Path,
    user: &str,
    keys: &[S],
) -> Result<PathBuf> {
    let path = authorized_keys_path(root_dir, user);
    let account_error = |reason: String| Error::Account {
        user: user.to_string(),
        reason,
    };

    let ssh_dir = path
        .parent()
        .ok_or_else(|| account_error(format!("no parent directory for {}", path.display())))?;
    if !ssh_dir.is_dir() {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(ssh_dir)
            .map_err(|e| account_error(format!("cannot create {}: {}", ssh_dir.display(), e)))?;
    }

    let contents = render_authorized_keys(keys);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)
        .map_err(|e| account_error(format!("cannot open {}: {}", path.display(), e)))?;
    file.write_all(contents.as_bytes())?;
    // mode() only applies on creation
    fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

    info!(
        "wrote {} key(s) to {}",
        contents.lines().filter(|l| !l.is_empty()).count(),
        path.display()
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIA alice@example";
    const KEY_B: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ bob@example";

    #[test]
    fn test_paths() {
        let root = Path::new("/");
        assert_eq!(
            authorized_keys_path(root, "root"),
            PathBuf::from("/root/.ssh/authorized_keys")
        );
        assert_eq!(
            authorized_keys_path(root, "core"),
            PathBuf::from("/home/core/.ssh/authorized_keys")
        );
    }

    #[test]
    fn test_render_trims_and_dedupes() {
        let keys = [format!("  {}\n", KEY_A), KEY_B.to_string(), KEY_A.to_string()];
        assert_eq!(render_authorized_keys(&keys), format!("{}\n{}\n", KEY_A, KEY_B));
    }

    #[test]
    fn test_render_empty() {
        let keys: [&str; 0] = [];
        assert_eq!(render_authorized_keys(&keys), "\n");
    }

    #[test]
    fn test_authorize_writes_file_with_modes() {
        let dir = TempDir::new().unwrap();
        let path = authorize_ssh_keys(dir.path(), "core", &[KEY_A, KEY_B]).unwrap();

        assert_eq!(path, dir.path().join("home/core/.ssh/authorized_keys"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("{}\n{}\n", KEY_A, KEY_B)
        );
        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn test_authorize_replaces_existing_keys() {
        let dir = TempDir::new().unwrap();
        authorize_ssh_keys(dir.path(), "root", &[KEY_A, KEY_B]).unwrap();
        let path = authorize_ssh_keys(dir.path(), "root", &[KEY_B]).unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), format!("{}\n", KEY_B));
    }
}

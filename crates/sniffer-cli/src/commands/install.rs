// Sniffer
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Git pre-commit hook installation

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use tracing::info;

/// First line after the shebang of every hook this command writes
const HOOK_MARKER: &str = "# managed by sniffer";

fn hook_script(config: Option<&Path>) -> String {
    let config_arg = config.map(|c| format!(" --config '{}'", c.display())).unwrap_or_default();
    format!(
        "#!/bin/sh\n{HOOK_MARKER}\n\
         files=$(git diff --cached --name-only --diff-filter=ACM | paste -sd, -)\n\
         [ -z \"$files\" ] && exit 0\n\
         exec sniffer sniff{config_arg} --files \"$files\"\n"
    )
}

pub fn install_hook(repo: &Path, config: Option<&Path>, force: bool) -> Result<PathBuf> {
    let git_dir = repo.join(".git");
    if !git_dir.is_dir() {
        bail!("{} is not a git repository", repo.display());
    }

    // The hook runs from the repository root, so pin the config path
    let config = match config {
        Some(path) => Some(std::fs::canonicalize(path).with_context(|| format!("Config file {} not found", path.display()))?),
        None => None,
    };

    let hooks = git_dir.join("hooks");
    std::fs::create_dir_all(&hooks).with_context(|| format!("Cannot create {}", hooks.display()))?;
    let hook = hooks.join("pre-commit");

    if hook.exists() && !force {
        let existing = std::fs::read_to_string(&hook).unwrap_or_default();
        if !existing.contains(HOOK_MARKER) {
            bail!("{} already exists and was not installed by sniffer; use --force to replace it", hook.display());
        }
    }

    std::fs::write(&hook, hook_script(config.as_deref())).with_context(|| format!("Cannot write {}", hook.display()))?;
    make_executable(&hook)?;
    info!("Installed pre-commit hook at {}", hook.display());
    println!("Installed pre-commit hook: {}", hook.display());
    Ok(hook)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions).with_context(|| format!("Cannot make {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        dir
    }

    #[test]
    fn test_installs_hook_with_config() {
        let dir = repo();
        let config = dir.path().join("sniffer.toml");
        std::fs::write(&config, "").unwrap();

        let hook = install_hook(dir.path(), Some(&config), false).unwrap();
        let script = std::fs::read_to_string(&hook).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains(HOOK_MARKER));
        assert!(script.contains("sniffer sniff --config"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(std::fs::metadata(&hook).unwrap().permissions().mode() & 0o111, 0o111);
        }
    }

    #[test]
    fn test_foreign_hook_needs_force() {
        let dir = repo();
        let hooks = dir.path().join(".git/hooks");
        std::fs::create_dir_all(&hooks).unwrap();
        std::fs::write(hooks.join("pre-commit"), "#!/bin/sh\nmake lint\n").unwrap();

        let err = install_hook(dir.path(), None, false).unwrap_err();
        assert!(err.to_string().contains("--force"));

        install_hook(dir.path(), None, true).unwrap();
        // reinstalling over our own hook needs no force
        install_hook(dir.path(), None, false).unwrap();
    }

    #[test]
    fn test_requires_git_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert!(install_hook(dir.path(), None, false).is_err());
    }
}

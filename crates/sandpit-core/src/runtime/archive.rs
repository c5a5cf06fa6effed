//! Tar bundles for file uploads
//!
//! Files reach a container as one archive extracted at `/`, so a bundle is
//! either applied whole or rejected whole by the backend.

use super::FileEntry;
use crate::{Result, SandpitError};
use std::path::{Component, Path, PathBuf};

/// Check that `name` is a plain file name with no path components
pub fn validate_file_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\', '\0']) => Ok(()),
        _ => Err(SandpitError::InvalidRequest(format!(
            "invalid file name: {name:?}"
        ))),
    }
}

/// Build an archive placing `files` under the absolute directory `dir`
pub fn bundle(dir: &Path, files: &[FileEntry]) -> Result<Vec<u8>> {
    let relative_dir = dir.strip_prefix("/").map_err(|_| {
        SandpitError::InjectionFailure(format!("target directory must be absolute: {}", dir.display()))
    })?;

    let mut builder = tar::Builder::new(Vec::new());

    let mut parent = PathBuf::new();
    for component in relative_dir.components() {
        parent.push(component);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        builder.append_data(&mut header, &parent, std::io::empty())?;
    }

    for file in files {
        validate_file_name(&file.name)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(file.contents.len() as u64);
        header.set_mtime(0);
        builder.append_data(&mut header, relative_dir.join(&file.name), file.contents.as_slice())?;
    }

    Ok(builder.into_inner()?)
}

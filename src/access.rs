// SPDX-License-Identifier: MIT

//! Read access for the HTTP layer: download locations, payload
//! verification and the bundle query.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use md5::{Digest, Md5};

use crate::catalog::{BundleRecord, CatalogWriter};
use crate::error::{Error, Result};

/// Absolute location of a component payload.
///
/// `component_path` is relative to the watched root. Paths that would leave
/// the root are refused.
pub fn download_path(root: &Path, component_path: &str) -> Result<PathBuf> {
    let relative = Path::new(component_path.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(Error::NotFound(format!("package {}", component_path)));
    }
    Ok(root.join(relative))
}

/// Hex MD5 of a file.
pub fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compares a payload with the hash from its catalog.
pub fn verify_package(path: &Path, hash_md5: &str) -> Result<bool> {
    Ok(md5_file(path)?.eq_ignore_ascii_case(hash_md5.trim()))
}

/// Bundles of every repository with artifacts, tagged with the repository.
pub fn bundles(writer: &CatalogWriter) -> Result<Vec<(String, BundleRecord)>> {
    let mut all = Vec::new();
    for repo_id in writer.repository_ids()? {
        match writer.read_bundles(&repo_id) {
            Ok(list) => all.extend(list.into_iter().map(|b| (repo_id.clone(), b))),
            // written before the components artifact, may be gone already
            Err(Error::MissingArtifact { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(all)
}

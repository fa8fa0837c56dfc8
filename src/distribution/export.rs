use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use log::info;

use crate::core::types::CertificateBundle;

#[cfg(not(unix))]
use log::warn;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

const CERT_FILENAME: &str = "cert.pem";
const CHAIN_FILENAME: &str = "chain.pem";
const FULLCHAIN_FILENAME: &str = "fullchain.pem";
const PRIVKEY_FILENAME: &str = "privkey.pem";

/// Writes issued bundles below a root directory, one folder per certificate.
#[derive(Debug, Clone)]
pub struct BundleExporter {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedBundle {
    pub output_dir: PathBuf,
    pub files: Vec<PathBuf>,
}

impl BundleExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Replaces `cert.pem`, `chain.pem`, `fullchain.pem` and `privkey.pem`
    /// under `<root>/<folder>/`, all mode 0600.
    pub fn export(&self, folder: &str, bundle: &CertificateBundle) -> Result<ExportedBundle> {
        let folder_name = folder_name_for(folder);
        validate_folder_name(&folder_name)?;
        let output_dir = self.root.join(&folder_name);
        fs::create_dir_all(&output_dir).with_context(|| {
            format!(
                "failed to create export directory at {}",
                output_dir.display()
            )
        })?;

        let contents = [
            (CERT_FILENAME, bundle.certificate_pem.clone()),
            (CHAIN_FILENAME, bundle.chain_pem.clone()),
            (FULLCHAIN_FILENAME, bundle.fullchain_pem()),
            (PRIVKEY_FILENAME, bundle.private_key_pem().to_string()),
        ];

        let mut files = Vec::with_capacity(contents.len());
        for (name, content) in &contents {
            let path = output_dir.join(name);
            write_secure_file(&path, content.as_bytes(), true)?;
            files.push(path);
        }

        info!(
            "[export] wrote {} file(s) to {}",
            files.len(),
            output_dir.display()
        );
        Ok(ExportedBundle { output_dir, files })
    }
}

/// Wildcard names become `_wildcard.<base>` so the folder is a plain segment.
fn folder_name_for(domain: &str) -> String {
    match domain.strip_prefix("*.") {
        Some(base) => format!("_wildcard.{base}"),
        None => domain.to_string(),
    }
}

fn validate_folder_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("folder name cannot be empty"));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(anyhow!("folder name must be a single path segment")),
    }
}

/// Writes `content` with owner-only permissions. Without `overwrite` an
/// existing file is an error.
pub(crate) fn write_secure_file(path: &Path, content: &[u8], overwrite: bool) -> Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    if overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    ensure_permissions(path)?;
    Ok(())
}

fn ensure_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let desired = fs::Permissions::from_mode(0o600);
        let metadata = fs::metadata(path)?;
        let current = metadata.permissions();
        if current.mode() & 0o777 != 0o600 {
            fs::set_permissions(path, desired).with_context(|| {
                format!(
                    "failed to set restrictive permissions on {}",
                    path.display()
                )
            })?;
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = fs::metadata(path) {
            warn!(
                "[export] warning: unable to confirm permissions for {}: {}",
                path.display(),
                err
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Secret;
    use crate::core::types::tests::self_signed;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("acme-export-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn sample_bundle(domains: &[&str]) -> CertificateBundle {
        let (cert_pem, key_pem) = self_signed(domains, Utc::now() + Duration::days(90));
        CertificateBundle::from_pem(&cert_pem, Secret::new(key_pem)).expect("bundle")
    }

    #[test]
    fn writes_expected_pem_files() {
        let dir = temp_dir();
        let exporter = BundleExporter::new(&dir);
        let bundle = sample_bundle(&["example.com"]);
        let exported = exporter.export("example.com", &bundle).expect("export");

        assert_eq!(exported.output_dir, dir.join("example.com"));
        assert_eq!(exported.files.len(), 4);
        let cert = fs::read_to_string(exported.output_dir.join(CERT_FILENAME)).expect("read cert");
        assert_eq!(pem::parse_many(&cert).expect("parse cert").len(), 1);
        let key = fs::read_to_string(exported.output_dir.join(PRIVKEY_FILENAME)).expect("read key");
        assert!(key.contains("PRIVATE KEY"));

        #[cfg(unix)]
        {
            let mode = fs::metadata(exported.output_dir.join(PRIVKEY_FILENAME))
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn renewal_overwrites_previous_files() {
        let dir = temp_dir();
        let exporter = BundleExporter::new(&dir);
        exporter
            .export("example.com", &sample_bundle(&["example.com"]))
            .expect("first export");
        let second = sample_bundle(&["example.com"]);
        let exported = exporter.export("example.com", &second).expect("second export");
        let cert = fs::read_to_string(exported.output_dir.join(CERT_FILENAME)).expect("read cert");
        assert_eq!(cert, second.certificate_pem);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn wildcard_names_get_a_plain_folder() {
        assert_eq!(folder_name_for("*.example.com"), "_wildcard.example.com");
        assert_eq!(folder_name_for("example.com"), "example.com");
    }

    #[test]
    fn rejects_nested_folder_names() {
        let dir = temp_dir();
        let exporter = BundleExporter::new(&dir);
        let err = exporter
            .export("../oops", &sample_bundle(&["example.com"]))
            .expect_err("expected error");
        assert!(err.to_string().contains("folder name"));
        fs::remove_dir_all(dir).ok();
    }
}

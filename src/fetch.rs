//! Custom-package acquisition: name derivation plus materialization from a
//! local path, a git remote, or an HTTP zip/tar archive into a staging
//! directory that is later tarred into the deployment container.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use regex::Regex;
use tokio::process::Command;
use walkdir::WalkDir;

use crate::config::CustomPackage;
use crate::error::{Error, Result};

/// Extension groups stripped from the last path segment, longest first, so
/// `pkg.tar.gz` becomes `pkg` while `my.pkg` stays untouched.
const EXTENSIONS: [&str; 5] = [".tar.gz", ".tgz", ".git", ".zip", ".tar"];

/// Canonical name of a custom package: `id` when set, otherwise the final
/// path segment with exactly one trailing recognized extension removed.
pub fn derive_name(pkg: &CustomPackage) -> String {
    if let Some(id) = &pkg.id {
        return id.clone();
    }
    let cleaned = pkg.path.trim_end_matches('/');
    // scp-style refs (git@host:org/repo.git) have no slash before the colon
    let segment = cleaned
        .rsplit('/')
        .next()
        .unwrap_or(cleaned)
        .rsplit(':')
        .next()
        .unwrap_or(cleaned);
    for ext in EXTENSIONS {
        if segment.len() > ext.len() {
            if let Some(stripped) = segment.strip_suffix(ext) {
                return stripped.to_string();
            }
        }
    }
    segment.to_string()
}

fn git_ref_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(git://|ssh://|[A-Za-z0-9_.-]+@[A-Za-z0-9_.-]+:)").unwrap())
}

pub fn is_http_url(path: &str) -> bool {
    path.starts_with("http://") || path.starts_with("https://")
}

fn is_http_archive(path: &str) -> bool {
    is_http_url(path)
        && (path.ends_with(".zip")
            || path.ends_with(".tar")
            || path.ends_with(".tar.gz")
            || path.ends_with(".tgz"))
}

pub fn is_git_reference(path: &str) -> bool {
    if is_http_archive(path) {
        return false;
    }
    git_ref_pattern().is_match(path) || path.trim_end_matches('/').ends_with(".git")
}

/// Materialize one custom package under `<staging>/<name>/` and return the
/// derived name. Source scheme priority: git, HTTP archive, local directory.
pub async fn fetch_into(pkg: &CustomPackage, staging: &Path) -> Result<String> {
    let name = derive_name(pkg);
    let dest = staging.join(&name);
    fs::create_dir_all(&dest).map_err(|e| Error::io(format!("create {}", dest.display()), e))?;

    if is_git_reference(&pkg.path) {
        info!("cloning {} -> {}", pkg.path, dest.display());
        clone_repository(pkg, &dest).await?;
    } else if is_http_url(&pkg.path) {
        info!("downloading {} -> {}", pkg.path, dest.display());
        download_archive(&pkg.path, &dest).await?;
    } else {
        info!("copying {} -> {}", pkg.path, dest.display());
        let src = PathBuf::from(&pkg.path);
        let dest = dest.clone();
        blocking(move || copy_tree(&src, &dest)).await?;
    }
    Ok(name)
}

/// Tar the whole staging root (uncompressed) for upload into the container.
/// `prefix` becomes the top-level directory inside the archive, so extraction
/// into an existing parent directory lands everything under one new dir.
pub async fn archive_staging(staging: &Path, prefix: &str) -> Result<Vec<u8>> {
    let root = staging.to_path_buf();
    let prefix = prefix.to_string();
    blocking(move || {
        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_dir_all(&prefix, &root)
            .map_err(|e| Error::io(format!("tar staging dir {}", root.display()), e))?;
        builder
            .into_inner()
            .map_err(|e| Error::io("finish staging tar", e))
    })
    .await
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::io("blocking task", std::io::Error::other(e)))?
}

// -- git --

/// If the configured password names a readable file, the trimmed file
/// contents are the secret; otherwise the literal value is.
fn resolve_secret(value: &str) -> String {
    let path = Path::new(value);
    if path.is_file() {
        if let Ok(contents) = fs::read_to_string(path) {
            return contents.trim_end().to_string();
        }
    }
    value.to_string()
}

async fn clone_repository(pkg: &CustomPackage, dest: &Path) -> Result<()> {
    let mut cmd = Command::new("git");
    cmd.args(["clone", "--depth", "1"])
        .arg(&pkg.path)
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0");

    if let Some(key) = &pkg.ssh_key {
        cmd.env(
            "GIT_SSH_COMMAND",
            format!(
                "ssh -i '{}' -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
                key.display()
            ),
        );
    }

    // Keep the helper dir alive until the clone finishes.
    let _askpass = match &pkg.ssh_password {
        Some(raw) => Some(setup_askpass(&mut cmd, &resolve_secret(raw))?),
        None => None,
    };

    let output = cmd
        .output()
        .await
        .map_err(|e| Error::io(format!("spawn git clone {}", pkg.path), e))?;
    if !output.status.success() {
        return Err(Error::GitClone {
            url: pkg.path.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Point git and ssh at a one-shot askpass script that prints the secret,
/// covering both HTTPS credentials and key passphrases without a terminal.
fn setup_askpass(cmd: &mut Command, secret: &str) -> Result<tempfile::TempDir> {
    let dir = tempfile::tempdir().map_err(|e| Error::io("create askpass dir", e))?;
    let script = dir.path().join("askpass.sh");
    fs::write(&script, "#!/bin/sh\nprintf '%s\\n' \"$STAGEHAND_ASKPASS\"\n")
        .map_err(|e| Error::io("write askpass helper", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o700))
            .map_err(|e| Error::io("chmod askpass helper", e))?;
    }
    cmd.env("GIT_ASKPASS", &script)
        .env("SSH_ASKPASS", &script)
        .env("SSH_ASKPASS_REQUIRE", "force")
        .env("STAGEHAND_ASKPASS", secret);
    if std::env::var_os("DISPLAY").is_none() {
        // ssh refuses to run the askpass helper without a display set
        cmd.env("DISPLAY", ":0");
    }
    Ok(dir)
}

// -- http --

async fn download_archive(url: &str, dest: &Path) -> Result<()> {
    let response = reqwest::get(url).await.map_err(|source| Error::Http {
        url: url.to_string(),
        source,
    })?;
    let status = response.status();
    if status.as_u16() != 200 {
        return Err(Error::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.bytes().await.map_err(|source| Error::Http {
        url: url.to_string(),
        source,
    })?;

    let url = url.to_string();
    let dest = dest.to_path_buf();
    if url.ends_with(".zip") {
        blocking(move || extract_zip(&body, &dest, &url)).await
    } else if url.ends_with(".tar") || url.ends_with(".tar.gz") || url.ends_with(".tgz") {
        blocking(move || extract_tar(&body, &dest, &url)).await
    } else {
        Err(Error::UnknownArchiveKind { url })
    }
}

fn extract_zip(bytes: &[u8], root: &Path, url: &str) -> Result<()> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| Error::MalformedArchive {
            url: url.to_string(),
            message: e.to_string(),
        })?;
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| Error::MalformedArchive {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        // Zip slip defense: every entry must resolve inside the staging root.
        let relative = entry.enclosed_name().ok_or_else(|| Error::ZipSlip {
            entry: entry.name().to_string(),
        })?;
        let target = root.join(&relative);
        if !target.starts_with(root) {
            return Err(Error::ZipSlip {
                entry: entry.name().to_string(),
            });
        }
        if entry.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| Error::io(format!("create {}", target.display()), e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }
        let mut out = fs::File::create(&target)
            .map_err(|e| Error::io(format!("create {}", target.display()), e))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| Error::io(format!("write {}", target.display()), e))?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
        }
    }
    debug!("unzipped {} entries from {url}", archive.len());
    Ok(())
}

fn extract_tar(bytes: &[u8], root: &Path, url: &str) -> Result<()> {
    // gzip magic bytes; the URL suffix alone does not decide
    let reader: Box<dyn Read> = if bytes.starts_with(&[0x1f, 0x8b]) {
        Box::new(GzDecoder::new(Cursor::new(bytes)))
    } else {
        Box::new(Cursor::new(bytes))
    };
    // Archive::unpack refuses entries that escape the destination root.
    tar::Archive::new(reader)
        .unpack(root)
        .map_err(|e| Error::MalformedArchive {
            url: url.to_string(),
            message: e.to_string(),
        })
}

// -- local --

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::BadLocalPath {
            path: src.to_path_buf(),
        });
    }
    // Symlinks are followed so their targets' contents come along.
    for entry in WalkDir::new(src).follow_links(true) {
        let entry =
            entry.map_err(|e| Error::io("walk local package", std::io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::io("walk local package", std::io::Error::other(e)))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| Error::io(format!("create {}", target.display()), e))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
            }
            fs::copy(entry.path(), &target)
                .map_err(|e| Error::io(format!("copy to {}", target.display()), e))?;
        } else {
            warn!("skipping {}: not a regular file or directory", entry.path().display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pkg(path: &str) -> CustomPackage {
        CustomPackage::ad_hoc(path)
    }

    #[test]
    fn name_derivation_prefers_id() {
        let mut p = pkg("https://host/org/test-package.git");
        p.id = Some("renamed".into());
        assert_eq!(derive_name(&p), "renamed");
    }

    #[test]
    fn name_derivation_strips_one_extension_group() {
        for (path, expected) in [
            ("https://host/org/test-package.git", "test-package"),
            ("git@host:org/test-package.git", "test-package"),
            ("git@host:test-package.git", "test-package"),
            ("https://example.com/pkg.tar", "pkg"),
            ("https://example.com/pkg.tar.gz", "pkg"),
            ("https://example.com/pkg.tgz", "pkg"),
            ("https://example.com/dist/pkg.zip", "pkg"),
            ("/home/path/test-package", "test-package"),
            ("/home/path/test-package/", "test-package"),
            ("/home/path/my.pkg", "my.pkg"),
            ("/home/path/archive.tar.zip", "archive.tar"),
        ] {
            assert_eq!(derive_name(&pkg(path)), expected, "path {path}");
        }
    }

    #[test]
    fn git_detection_excludes_http_archives() {
        assert!(is_git_reference("git@host:org/repo.git"));
        assert!(is_git_reference("ssh://git@host/org/repo"));
        assert!(is_git_reference("git://host/repo"));
        assert!(is_git_reference("https://host/org/repo.git"));
        assert!(!is_git_reference("https://host/org/repo.zip"));
        assert!(!is_git_reference("https://host/org/repo.tar.gz"));
        assert!(!is_git_reference("/srv/pkgs/repo"));
    }

    #[test]
    fn secret_resolution_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let secret_file = dir.path().join("secret");
        fs::write(&secret_file, "hunter2\n").unwrap();
        assert_eq!(resolve_secret(secret_file.to_str().unwrap()), "hunter2");
        assert_eq!(resolve_secret("literal-password"), "literal-password");
    }

    #[test]
    fn zip_extraction_rejects_traversal() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("../evil.txt", options).unwrap();
            writer.write_all(b"nope").unwrap();
            writer.finish().unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let err = extract_zip(cursor.get_ref(), dir.path(), "https://x/e.zip").unwrap_err();
        assert!(matches!(err, Error::ZipSlip { .. }));
        assert!(!dir.path().join("../evil.txt").exists());
    }

    #[test]
    fn zip_extraction_writes_nested_entries() {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            writer.add_directory("sub/", options).unwrap();
            writer.start_file("sub/file.txt", options).unwrap();
            writer.write_all(b"hello").unwrap();
            writer.finish().unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        extract_zip(cursor.get_ref(), dir.path(), "https://x/p.zip").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("sub/file.txt")).unwrap(),
            "hello"
        );
    }

    fn tar_bytes() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let body = b"compose: {}\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "deploy.yaml", &body[..])
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn tar_extraction_handles_plain_and_gzip() {
        let plain = tar_bytes();
        let dir = tempfile::tempdir().unwrap();
        extract_tar(&plain, dir.path(), "https://x/p.tar").unwrap();
        assert!(dir.path().join("deploy.yaml").exists());

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&plain).unwrap();
        let gz = encoder.finish().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        extract_tar(&gz, dir2.path(), "https://x/p.tar.gz").unwrap();
        assert!(dir2.path().join("deploy.yaml").exists());
    }

    #[test]
    fn local_copy_is_recursive() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("nested")).unwrap();
        fs::write(src.path().join("nested/a.txt"), "a").unwrap();
        fs::write(src.path().join("top.txt"), "t").unwrap();

        let dest = tempfile::tempdir().unwrap();
        copy_tree(src.path(), dest.path()).unwrap();
        assert!(dest.path().join("nested/a.txt").exists());
        assert!(dest.path().join("top.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn local_copy_follows_symlinks() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("real")).unwrap();
        fs::write(src.path().join("real/a.txt"), "a").unwrap();
        std::os::unix::fs::symlink(src.path().join("real/a.txt"), src.path().join("link.txt"))
            .unwrap();
        std::os::unix::fs::symlink(src.path().join("real"), src.path().join("linked-dir"))
            .unwrap();

        let dest = tempfile::tempdir().unwrap();
        copy_tree(src.path(), dest.path()).unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("link.txt")).unwrap(), "a");
        assert_eq!(
            fs::read_to_string(dest.path().join("linked-dir/a.txt")).unwrap(),
            "a"
        );
    }

    #[test]
    fn local_copy_requires_a_directory() {
        let dest = tempfile::tempdir().unwrap();
        let err = copy_tree(Path::new("/nonexistent/pkg"), dest.path()).unwrap_err();
        assert!(matches!(err, Error::BadLocalPath { .. }));
    }

    #[tokio::test]
    async fn http_tar_fetch_materializes_named_staging_dir() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pkg.tar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_bytes()))
            .mount(&server)
            .await;

        let staging = tempfile::tempdir().unwrap();
        let custom = pkg(&format!("{}/pkg.tar", server.uri()));
        let name = fetch_into(&custom, staging.path()).await.unwrap();
        assert_eq!(name, "pkg");
        assert!(staging.path().join("pkg/deploy.yaml").exists());
    }

    #[tokio::test]
    async fn http_non_200_is_fatal() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone.zip"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let staging = tempfile::tempdir().unwrap();
        let custom = pkg(&format!("{}/gone.zip", server.uri()));
        let err = fetch_into(&custom, staging.path()).await.unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn staging_archive_contains_package_dirs() {
        let staging = tempfile::tempdir().unwrap();
        fs::create_dir_all(staging.path().join("pkg")).unwrap();
        fs::write(staging.path().join("pkg/file"), "x").unwrap();

        let bytes = archive_staging(staging.path(), "custom-packages")
            .await
            .unwrap();
        let mut archive = tar::Archive::new(Cursor::new(bytes));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "custom-packages/pkg/file"));
    }
}

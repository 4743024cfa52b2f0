use std::path::Path;

use tokio::io::AsyncWriteExt;

use crate::stage::StageErrorKind;

/// How a line of a configuration file relates to the setting being enabled
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineState {
    /// Commented out, replace it with the given line
    Commented(String),
    /// Already enabled
    Enabled,
    Unrelated,
}

#[tracing::instrument(level = "trace", skip(path), fields(path = %path.display()))]
pub(crate) async fn create_dir_all(path: &Path) -> Result<(), StageErrorKind> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| StageErrorKind::CreateDirectory(path.to_owned(), e))
}

/// Replace the contents of `destination`, creating its parent directories
///
/// An existing `destination` keeps its permissions.
pub(crate) async fn write_atomic(destination: &Path, body: &str) -> Result<(), StageErrorKind> {
    if let Some(parent) = destination.parent() {
        create_dir_all(parent).await?;
    }

    let permissions = match tokio::fs::metadata(destination).await {
        Ok(metadata) => Some(metadata.permissions()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(StageErrorKind::Read(destination.to_owned(), e)),
    };

    let temp = destination.with_extension("tmp");

    tokio::fs::write(&temp, body)
        .await
        .map_err(|e| StageErrorKind::Write(temp.to_owned(), e))?;

    if let Some(permissions) = permissions {
        tokio::fs::set_permissions(&temp, permissions)
            .await
            .map_err(|e| StageErrorKind::SetPermissions(temp.to_owned(), e))?;
    }

    tokio::fs::rename(&temp, &destination)
        .await
        .map_err(|e| StageErrorKind::Rename(temp, destination.into(), e))?;

    Ok(())
}

#[tracing::instrument(level = "trace", skip(path, body), fields(path = %path.display()))]
pub(crate) async fn append(path: &Path, body: &str) -> Result<(), StageErrorKind> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StageErrorKind::Write(path.to_owned(), e))?;
    file.write_all(body.as_bytes())
        .await
        .map_err(|e| StageErrorKind::Write(path.to_owned(), e))?;
    file.flush()
        .await
        .map_err(|e| StageErrorKind::Write(path.to_owned(), e))?;
    Ok(())
}

/** Uncomment the lines of `path` that `classify` reports as [`LineState::Commented`]

Returns whether the setting is enabled afterwards, that is whether any line was uncommented or
already [`LineState::Enabled`]. The file is only rewritten if a line changed.
*/
#[tracing::instrument(level = "trace", skip(path, classify), fields(path = %path.display()))]
pub(crate) async fn uncomment_lines(
    path: &Path,
    classify: impl Fn(&str) -> LineState,
) -> Result<bool, StageErrorKind> {
    let buf = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| StageErrorKind::Read(path.to_owned(), e))?;

    let mut enabled = false;
    let mut changed = false;
    let mut output = String::with_capacity(buf.len());
    for line in buf.lines() {
        match classify(line) {
            LineState::Commented(replacement) => {
                output.push_str(&replacement);
                enabled = true;
                changed = true;
            },
            LineState::Enabled => {
                output.push_str(line);
                enabled = true;
            },
            LineState::Unrelated => output.push_str(line),
        }
        output.push('\n');
    }

    if changed {
        write_atomic(path, &output).await?;
    }

    Ok(enabled)
}

#[cfg(test)]
mod test {
    use super::*;

    fn classify_foo(line: &str) -> LineState {
        match line {
            "foo" => LineState::Enabled,
            "#foo" => LineState::Commented("foo".into()),
            _ => LineState::Unrelated,
        }
    }

    #[tokio::test]
    async fn uncomments_matching_lines() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let test_file = temp_dir.path().join("uncomments_matching_lines");
        tokio::fs::write(&test_file, "# header\n#foo\n#bar\n").await?;

        assert!(uncomment_lines(&test_file, classify_foo).await?);
        assert_eq!(
            tokio::fs::read_to_string(&test_file).await?,
            "# header\nfoo\n#bar\n"
        );

        // A second pass finds it enabled and leaves the file alone
        assert!(uncomment_lines(&test_file, classify_foo).await?);
        Ok(())
    }

    #[tokio::test]
    async fn reports_missing_setting() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let test_file = temp_dir.path().join("reports_missing_setting");
        tokio::fs::write(&test_file, "#bar\n").await?;

        assert!(!uncomment_lines(&test_file, classify_foo).await?);
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_an_error() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let test_file = temp_dir.path().join("missing");
        assert!(matches!(
            uncomment_lines(&test_file, classify_foo).await,
            Err(StageErrorKind::Read(..))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn uncommenting_keeps_permissions() -> eyre::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::tempdir()?;
        let test_file = temp_dir.path().join("uncommenting_keeps_permissions");
        tokio::fs::write(&test_file, "#foo\n").await?;
        tokio::fs::set_permissions(&test_file, std::fs::Permissions::from_mode(0o440)).await?;

        assert!(uncomment_lines(&test_file, classify_foo).await?);
        assert_eq!(tokio::fs::read_to_string(&test_file).await?, "foo\n");
        let mode = tokio::fs::metadata(&test_file).await?.permissions().mode();
        assert_eq!(mode & 0o777, 0o440);
        Ok(())
    }

    #[tokio::test]
    async fn write_atomic_creates_parents() -> eyre::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let test_file = temp_dir.path().join("boot/grub/grub-standalone.cfg");
        write_atomic(&test_file, "boot\n").await?;
        assert_eq!(tokio::fs::read_to_string(&test_file).await?, "boot\n");
        append(&test_file, "more\n").await?;
        assert_eq!(tokio::fs::read_to_string(&test_file).await?, "boot\nmore\n");
        Ok(())
    }
}

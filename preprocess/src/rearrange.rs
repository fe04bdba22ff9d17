//! Moves normalized files into one folder per label.

use crate::common::*;

/// The result of [rearrange_by_label].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RearrangeSummary {
    /// Number of files moved into label folders.
    pub moved: usize,
    /// Files left in place because the label file has no entry for them.
    pub unlabeled: Vec<PathBuf>,
}

/// Moves every file directly under `dir` into `dir/<label>/`.
///
/// It needs the complete listing, so it must run after all files are
/// written. Files are matched to labels by their stem.
pub fn rearrange_by_label(dir: &Path, labels: &LabelFile) -> Result<RearrangeSummary> {
    let files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("unable to list '{}'", dir.display()))?
        .map(|entry| -> Result<_> { Ok(entry?.path()) })
        .filter_ok(|path| path.is_file())
        .try_collect()?;

    let mut summary = RearrangeSummary::default();

    for path in files.into_iter().sorted() {
        let label = match labels.label_of(&path) {
            Some(label) => label,
            None => {
                warn!("no label for '{}', left in place", path.display());
                summary.unlabeled.push(path);
                continue;
            }
        };

        let file_name = path
            .file_name()
            .ok_or_else(|| format_err!("invalid file name '{}'", path.display()))?;
        let label_dir = dir.join(label);
        fs::create_dir_all(&label_dir)
            .with_context(|| format!("unable to create '{}'", label_dir.display()))?;
        let target = label_dir.join(file_name);
        fs::rename(&path, &target).with_context(|| {
            format!(
                "unable to move '{}' to '{}'",
                path.display(),
                target.display()
            )
        })?;
        summary.moved += 1;
    }

    Ok(summary)
}

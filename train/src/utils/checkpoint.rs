use crate::{common::*, model::EmbeddingModel};

pub const FILE_STRFTIME: &str = "%Y%m%d-%H%M%S";
pub const BEST_WEIGHTS_FILE: &str = "best_weights.bin";

/// The position of a checkpoint in a training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CheckpointTag {
    Iteration(usize),
    Last,
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iteration(iteration) => write!(f, "iter_{}", iteration),
            Self::Last => f.write_str("last"),
        }
    }
}

/// Returns `weights_at_<timestamp>_<tag>.bin`.
pub fn checkpoint_file_name(time: &NaiveDateTime, tag: CheckpointTag) -> String {
    format!("weights_at_{}_{}.bin", time.format(FILE_STRFTIME), tag)
}

/// Saves model weights to a timestamped checkpoint file.
pub fn save_checkpoint<M>(model: &M, dir: &Path, tag: CheckpointTag) -> Result<PathBuf>
where
    M: EmbeddingModel + ?Sized,
{
    let file_name = checkpoint_file_name(&Local::now().naive_local(), tag);
    let path = dir.join(file_name);
    model
        .save_weights(&path)
        .with_context(|| format!("unable to save checkpoint '{}'", path.display()))?;
    info!("saved checkpoint '{}'", path.display());
    Ok(path)
}

/// Parses the timestamp and tag of a checkpoint file name.
pub fn parse_checkpoint_file_name(file_name: &str) -> Option<(NaiveDateTime, CheckpointTag)> {
    let regex = Regex::new(r"^weights_at_(\d{8}-\d{6})_(?:iter_(\d+)|(last))\.bin$").ok()?;
    let captures = regex.captures(file_name)?;
    let time = NaiveDateTime::parse_from_str(captures.get(1)?.as_str(), FILE_STRFTIME).ok()?;
    let tag = match captures.get(2) {
        Some(iteration) => CheckpointTag::Iteration(iteration.as_str().parse().ok()?),
        None => {
            captures.get(3)?;
            CheckpointTag::Last
        }
    };
    Some((time, tag))
}

/// Finds the newest checkpoint in a directory.
///
/// Newer timestamps win. Within the same second, the final checkpoint wins
/// over iteration checkpoints, and later iterations over earlier ones.
pub fn find_latest_checkpoint(dir: &Path) -> Result<Option<PathBuf>> {
    let dir_str = dir
        .to_str()
        .ok_or_else(|| format_err!("non-UTF-8 path '{}'", dir.display()))?;
    let pattern = format!("{}/weights_at_*.bin", glob::Pattern::escape(dir_str));
    let paths: Vec<PathBuf> = glob::glob(&pattern)?.try_collect()?;

    let latest = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let key = parse_checkpoint_file_name(file_name)?;
            Some((path, key))
        })
        .max_by_key(|(_, key)| *key)
        .map(|(path, _)| path);

    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, FILE_STRFTIME).unwrap()
    }

    #[test]
    fn file_names() {
        let stamp = time("20220315-093005");
        let name = checkpoint_file_name(&stamp, CheckpointTag::Iteration(12));
        assert_eq!(name, "weights_at_20220315-093005_iter_12.bin");
        assert_eq!(
            parse_checkpoint_file_name(&name),
            Some((stamp, CheckpointTag::Iteration(12)))
        );

        let name = checkpoint_file_name(&stamp, CheckpointTag::Last);
        assert_eq!(name, "weights_at_20220315-093005_last.bin");
        assert_eq!(
            parse_checkpoint_file_name(&name),
            Some((stamp, CheckpointTag::Last))
        );

        assert_eq!(parse_checkpoint_file_name("best_weights.bin"), None);
        assert_eq!(parse_checkpoint_file_name("weights_at_2022_last.bin"), None);
    }

    #[test]
    fn latest_wins() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_latest_checkpoint(dir.path()).unwrap(), None);

        let names = [
            "weights_at_20220101-000000_last.bin",
            "weights_at_20220301-120000_iter_50.bin",
            "weights_at_20220301-120000_iter_100.bin",
            "weights_at_20220201-000000_iter_900.bin",
            "unrelated.bin",
        ];
        for name in names {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(
            find_latest_checkpoint(dir.path()).unwrap(),
            Some(dir.path().join("weights_at_20220301-120000_iter_100.bin"))
        );

        fs::write(dir.path().join("weights_at_20220301-120000_last.bin"), b"").unwrap();
        assert_eq!(
            find_latest_checkpoint(dir.path()).unwrap(),
            Some(dir.path().join("weights_at_20220301-120000_last.bin"))
        );
    }
}

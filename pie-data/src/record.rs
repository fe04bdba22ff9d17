//! Image records and the CSV files that label them.

use crate::{common::*, error::PieError};

/// File extensions recognized as images.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// One image of a dataset.
///
/// The path identifies the record. The label may be remapped by splitting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub label: String,
    pub pose: Option<String>,
}

/// Tells if the path has an image file extension.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// The file name without directory and extension.
pub fn file_stem(path: &Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| PieError::data(format!("invalid file name '{}'", path.display())))?;
    Ok(stem.to_owned())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct LabelRow {
    file: String,
    label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct PoseRow {
    file: String,
    pose: String,
}

/// The `file,label` CSV file.
///
/// File names carry no directory. Entries are keyed by the file stem since
/// normalized images change their extension.
#[derive(Debug, Clone)]
pub struct LabelFile {
    entries: IndexMap<String, (String, String)>,
}

impl LabelFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|err| {
                PieError::data(format!(
                    "unable to open label file '{}': {}",
                    path.display(),
                    err
                ))
            })?;
        Self::from_reader(reader).with_context(|| format!("in label file '{}'", path.display()))
    }

    pub fn from_reader<R>(mut reader: csv::Reader<R>) -> Result<Self>
    where
        R: std::io::Read,
    {
        let headers = reader
            .headers()
            .map_err(|err| PieError::data(format!("malformed label file header: {}", err)))?;
        if !(headers.iter().any(|h| h == "file") && headers.iter().any(|h| h == "label")) {
            return Err(PieError::data("label file must have a 'file,label' header").into());
        }

        let mut entries = IndexMap::new();
        for (line, row) in reader.deserialize::<LabelRow>().enumerate() {
            let LabelRow { file, label } = row.map_err(|err| {
                PieError::data(format!("malformed label row {}: {}", line + 2, err))
            })?;
            if file.is_empty() || label.is_empty() {
                return Err(
                    PieError::data(format!("empty field in label row {}", line + 2)).into(),
                );
            }
            let stem = file_stem(Path::new(&file))?;
            if let Some((prev, _)) = entries.insert(stem.clone(), (file.clone(), label)) {
                warn!(
                    "label file lists '{}' and '{}' with the same stem '{}', the latter wins",
                    prev, file, stem
                );
            }
        }

        if entries.is_empty() {
            return Err(PieError::data("label file has no entries").into());
        }

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up the label by a file name or path with any extension.
    pub fn label_of(&self, path: impl AsRef<Path>) -> Option<&str> {
        let stem = file_stem(path.as_ref()).ok()?;
        self.entries.get(&stem).map(|(_, label)| label.as_str())
    }

    /// The listed file names, in file order.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.entries.values().map(|(file, _)| file.as_str())
    }

    /// The distinct labels, sorted.
    pub fn labels(&self) -> Vec<&str> {
        self.entries
            .values()
            .map(|(_, label)| label.as_str())
            .unique()
            .sorted()
            .collect()
    }

    pub fn write<P>(path: P, rows: impl IntoIterator<Item = (String, String)>) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("unable to create label file '{}'", path.display()))?;
        writer.write_record(&["file", "label"])?;
        for (file, label) in rows {
            writer.write_record(&[file, label])?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Loads a `file,pose` CSV into a map keyed by file stem.
pub fn load_pose_file(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| {
            PieError::data(format!(
                "unable to open pose file '{}': {}",
                path.display(),
                err
            ))
        })?;

    reader
        .deserialize::<PoseRow>()
        .map(|row| -> Result<_> {
            let PoseRow { file, pose } = row
                .map_err(|err| PieError::data(format!("malformed pose file row: {}", err)))?;
            Ok((file_stem(Path::new(&file))?, pose))
        })
        .try_collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_data_error;

    fn parse(text: &str) -> Result<LabelFile> {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        LabelFile::from_reader(reader)
    }

    #[test]
    fn label_file_keyed_by_stem() {
        let labels = parse("file,label\na.jpg,manta-1\nb.JPG,manta-2\nc.png,manta-1\n").unwrap();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels.label_of("a.png"), Some("manta-1"));
        assert_eq!(labels.label_of("/out/b.png"), Some("manta-2"));
        assert_eq!(labels.label_of("d.png"), None);
        assert_eq!(labels.labels(), vec!["manta-1", "manta-2"]);
    }

    #[test]
    fn label_file_without_header_is_rejected() {
        let err = parse("name,id\na.jpg,1\n").unwrap_err();
        assert!(is_data_error(&err));
    }

    #[test]
    fn empty_label_file_is_rejected() {
        let err = parse("file,label\n").unwrap_err();
        assert!(is_data_error(&err));
    }

    #[test]
    fn recognize_image_files() {
        assert!(is_image_file(Path::new("x/a.PNG")));
        assert!(is_image_file(Path::new("a.jpeg")));
        assert!(!is_image_file(Path::new("a.json")));
        assert!(!is_image_file(Path::new("noext")));
    }
}

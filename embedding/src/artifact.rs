//! Embedding tables, label tables and compact 8-bit embeddings.

use crate::common::*;

/// Writes embeddings as a CSV table with an `emb_0..emb_{N-1}` header.
pub fn write_embeddings(path: impl AsRef<Path>, embeddings: ArrayView2<f32>) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("unable to create embedding table '{}'", path.display()))?;

    let header: Vec<String> = (0..embeddings.ncols())
        .map(|index| format!("emb_{}", index))
        .collect();
    writer.write_record(&header)?;
    for row in embeddings.outer_iter() {
        writer.write_record(row.iter().map(|value| value.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads an embedding table written by [write_embeddings].
///
/// A header starting with `# ` is accepted as well.
pub fn read_embeddings(path: impl AsRef<Path>) -> Result<Array2<f32>> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| {
            PieError::data(format!(
                "unable to open embedding table '{}': {}",
                path.display(),
                err
            ))
        })?;
    parse_embeddings(reader).with_context(|| format!("in embedding table '{}'", path.display()))
}

fn parse_embeddings<R>(mut reader: csv::Reader<R>) -> Result<Array2<f32>>
where
    R: std::io::Read,
{
    let headers = reader
        .headers()
        .map_err(|err| PieError::data(format!("malformed header: {}", err)))?
        .clone();

    let dim = headers.len();
    for (index, name) in headers.iter().enumerate() {
        let name = if index == 0 {
            name.trim_start_matches('#').trim_start()
        } else {
            name
        };
        if name != format!("emb_{}", index) {
            return Err(PieError::data(format!(
                "expect column 'emb_{}', but get '{}'",
                index, name
            ))
            .into());
        }
    }

    let mut values = vec![];
    let mut num_rows = 0;
    for (line, record) in reader.records().enumerate() {
        let record =
            record.map_err(|err| PieError::data(format!("malformed row {}: {}", line + 2, err)))?;
        if record.len() != dim {
            return Err(PieError::data(format!(
                "row {} has {} values, but the header has {}",
                line + 2,
                record.len(),
                dim
            ))
            .into());
        }
        for field in record.iter() {
            let value: f32 = field.parse().map_err(|_| {
                PieError::data(format!("invalid number '{}' in row {}", field, line + 2))
            })?;
            values.push(value);
        }
        num_rows += 1;
    }

    let embeddings = Array2::from_shape_vec((num_rows, dim), values)?;
    Ok(embeddings)
}

/// One row of the labels table aligned with an embedding table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// Zero-based class id of the name.
    pub class: usize,
    pub file: String,
    pub name: String,
}

impl LabelRecord {
    /// Builds rows from `(file, name)` pairs. Class ids follow the sorted
    /// distinct names.
    pub fn from_names<I, F, N>(entries: I) -> Vec<Self>
    where
        I: IntoIterator<Item = (F, N)>,
        F: Into<String>,
        N: Into<String>,
    {
        let entries: Vec<(String, String)> = entries
            .into_iter()
            .map(|(file, name)| (file.into(), name.into()))
            .collect();
        let classes: HashMap<&str, usize> = entries
            .iter()
            .map(|(_, name)| name.as_str())
            .unique()
            .sorted()
            .enumerate()
            .map(|(class, name)| (name, class))
            .collect();

        entries
            .iter()
            .map(|(file, name)| Self {
                class: classes[name.as_str()],
                file: file.clone(),
                name: name.clone(),
            })
            .collect()
    }
}

pub fn write_labels(path: impl AsRef<Path>, records: &[LabelRecord]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("unable to create labels table '{}'", path.display()))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_labels(path: impl AsRef<Path>) -> Result<Vec<LabelRecord>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| {
            PieError::data(format!(
                "unable to open labels table '{}': {}",
                path.display(),
                err
            ))
        })?;
    let records = reader
        .deserialize::<LabelRecord>()
        .enumerate()
        .map(|(line, row)| {
            row.map_err(|err| -> Error {
                PieError::data(format!(
                    "malformed row {} in '{}': {}",
                    line + 2,
                    path.display(),
                    err
                ))
                .into()
            })
        })
        .collect::<Result<Vec<LabelRecord>>>()?;
    Ok(records)
}

/// Affine 8-bit quantization between the minimum and maximum of an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantizer {
    pub min: f32,
    pub max: f32,
}

impl Quantizer {
    pub fn fit(values: &[f32]) -> Result<Self> {
        ensure!(!values.is_empty(), "cannot quantize an empty embedding");
        ensure!(
            values.iter().all(|value| value.is_finite()),
            "embedding contains non-finite values"
        );
        let (min, max) = values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &value| {
                (min.min(value), max.max(value))
            });
        Ok(Self { min, max })
    }

    fn scale(&self) -> f32 {
        (self.max - self.min) / 255.0
    }

    pub fn encode(&self, values: &[f32]) -> Vec<u8> {
        let scale = self.scale();
        values
            .iter()
            .map(|&value| {
                if scale > 0.0 {
                    ((value - self.min) / scale).round().clamp(0.0, 255.0) as u8
                } else {
                    0
                }
            })
            .collect()
    }

    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let scale = self.scale();
        codes
            .iter()
            .map(|&code| self.min + code as f32 * scale)
            .collect()
    }

    /// The largest error [Quantizer::decode] makes on fitted values.
    pub fn max_error(&self) -> f32 {
        self.scale() / 2.0
    }
}

/// An embedding stored with one byte per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedEmbedding {
    pub quantizer: Quantizer,
    pub codes: Vec<u8>,
}

impl QuantizedEmbedding {
    pub fn new(values: &[f32]) -> Result<Self> {
        let quantizer = Quantizer::fit(values)?;
        let codes = quantizer.encode(values);
        Ok(Self { quantizer, codes })
    }

    pub fn to_f32(&self) -> Array1<f32> {
        Array1::from(self.quantizer.decode(&self.codes))
    }
}

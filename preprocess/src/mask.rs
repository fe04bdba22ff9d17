//! Masks outlining the region of interest and the sessions that produce them.

use crate::common::*;

/// A polygon or line outlining the pattern of interest, in source pixel
/// coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    /// `(x, y)` points in drawing order.
    pub points: Vec<(f64, f64)>,
}

impl Mask {
    pub fn new(points: Vec<(f64, f64)>) -> Self {
        Self { points }
    }

    /// The `(min_x, min_y, max_x, max_y)` bounds of the points.
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let (first, rest) = self.points.split_first()?;
        let init = (first.0, first.1, first.0, first.1);
        let bounds = rest
            .iter()
            .fold(init, |(min_x, min_y, max_x, max_y), &(x, y)| {
                (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
            });
        Some(bounds)
    }

    /// The file a mask of the image is persisted to.
    pub fn path_for(mask_dir: &Path, image: &Path) -> Result<PathBuf> {
        Ok(mask_dir.join(format!("{}.json", file_stem(image)?)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to read mask '{}'", path.display()))?;
        let mask = serde_json::from_str(&text)
            .map_err(|err| PieError::data(format!("malformed mask '{}': {}", path.display(), err)))?;
        Ok(mask)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string(self)?;
        fs::write(path, text).with_context(|| format!("unable to write mask '{}'", path.display()))?;
        Ok(())
    }
}

/// The outcome of masking one image.
#[derive(Debug, Clone, PartialEq)]
pub enum MaskDecision {
    /// Process the image, cropped by the mask or whole without one.
    Save(Option<Mask>),
    /// Exclude the image from the output.
    Skip,
    /// Stop issuing new work.
    Abort,
}

/// The interaction surface deciding how each image is masked.
///
/// A session is driven by a single coordinating thread, one image at a time.
pub trait MaskSession: Send {
    fn decide(&mut self, image: &Path) -> Result<MaskDecision>;
}

/// Reuses masks saved by an earlier session. Images without a saved mask are
/// processed whole. Without a mask directory every image is processed whole.
#[derive(Debug, Clone, Default)]
pub struct StoredMaskSession {
    mask_dir: Option<PathBuf>,
}

impl StoredMaskSession {
    pub fn new(mask_dir: Option<PathBuf>) -> Self {
        Self { mask_dir }
    }
}

impl MaskSession for StoredMaskSession {
    fn decide(&mut self, image: &Path) -> Result<MaskDecision> {
        let mask = match &self.mask_dir {
            Some(dir) => {
                let path = Mask::path_for(dir, image)?;
                if path.is_file() {
                    Some(Mask::load(&path)?)
                } else {
                    None
                }
            }
            None => None,
        };
        Ok(MaskDecision::Save(mask))
    }
}

/// Prompts for masks on a text interface.
///
/// Commands, one per line:
///
/// - `s x,y x,y ...` crops by the outlined points and saves the mask
/// - `s` processes the whole image
/// - `q` skips the image
/// - `esc` aborts the job
///
/// End of input aborts the job.
#[derive(Debug)]
pub struct TerminalMaskSession<R, W> {
    input: R,
    output: W,
    mask_dir: Option<PathBuf>,
}

impl<R, W> TerminalMaskSession<R, W>
where
    R: BufRead,
    W: Write,
{
    pub fn new(input: R, output: W, mask_dir: Option<PathBuf>) -> Self {
        Self {
            input,
            output,
            mask_dir,
        }
    }

    fn prompt(&mut self, image: &Path) -> Result<Option<String>> {
        write!(self.output, "{} > ", image.display())?;
        self.output.flush()?;

        let mut line = String::new();
        let len = self.input.read_line(&mut line)?;
        Ok((len > 0).then(|| line.trim().to_owned()))
    }
}

impl<R, W> MaskSession for TerminalMaskSession<R, W>
where
    R: BufRead + Send,
    W: Write + Send,
{
    fn decide(&mut self, image: &Path) -> Result<MaskDecision> {
        loop {
            let line = match self.prompt(image)? {
                Some(line) => line,
                None => return Ok(MaskDecision::Abort),
            };

            match parse_command(&line) {
                Ok(MaskDecision::Save(Some(mask))) => {
                    if let Some(dir) = &self.mask_dir {
                        mask.save(Mask::path_for(dir, image)?)?;
                    }
                    return Ok(MaskDecision::Save(Some(mask)));
                }
                Ok(decision) => return Ok(decision),
                Err(err) => {
                    writeln!(self.output, "{}", err)?;
                    writeln!(
                        self.output,
                        "usage: 's x,y x,y ...' to crop, 's' to keep the whole image, 'q' to skip, 'esc' to exit"
                    )?;
                }
            }
        }
    }
}

fn parse_command(line: &str) -> Result<MaskDecision> {
    let mut tokens = line.split_whitespace();
    let decision = match tokens.next() {
        Some("q") => MaskDecision::Skip,
        Some("esc") => MaskDecision::Abort,
        Some("s") => {
            let points: Vec<(f64, f64)> = tokens.map(parse_point).try_collect()?;
            match points.len() {
                0 => MaskDecision::Save(None),
                1 => bail!("a mask needs at least two points"),
                _ => MaskDecision::Save(Some(Mask::new(points))),
            }
        }
        Some(other) => bail!("unknown command '{}'", other),
        None => bail!("empty command"),
    };
    Ok(decision)
}

fn parse_point(token: &str) -> Result<(f64, f64)> {
    let (x, y) = token
        .split_once(',')
        .ok_or_else(|| format_err!("invalid point '{}', expect 'x,y'", token))?;
    let x: f64 = x
        .trim()
        .parse()
        .with_context(|| format!("invalid x coordinate in '{}'", token))?;
    let y: f64 = y
        .trim()
        .parse()
        .with_context(|| format!("invalid y coordinate in '{}'", token))?;
    ensure!(
        x.is_finite() && y.is_finite(),
        "coordinates must be finite, but get '{}'",
        token
    );
    Ok((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        assert_eq!(parse_command("q").unwrap(), MaskDecision::Skip);
        assert_eq!(parse_command("esc").unwrap(), MaskDecision::Abort);
        assert_eq!(parse_command("s").unwrap(), MaskDecision::Save(None));
        assert_eq!(
            parse_command("s 1,2 3.5,4").unwrap(),
            MaskDecision::Save(Some(Mask::new(vec![(1.0, 2.0), (3.5, 4.0)])))
        );
        assert!(parse_command("s 1,2").is_err());
        assert!(parse_command("s 1;2 3,4").is_err());
        assert!(parse_command("x").is_err());
        assert!(parse_command("").is_err());
    }

    #[test]
    fn terminal_session_reprompts_and_saves_masks() {
        let dir = tempfile::tempdir().unwrap();
        let input = b"hello\ns 0,0 10,5 4,8\nq\n" as &[u8];
        let mut output = vec![];
        let mut session =
            TerminalMaskSession::new(input, &mut output, Some(dir.path().to_owned()));

        let first = session.decide(Path::new("in/ray-01.jpg")).unwrap();
        let mask = match first {
            MaskDecision::Save(Some(mask)) => mask,
            other => panic!("unexpected decision {:?}", other),
        };
        assert_eq!(mask.bounds(), Some((0.0, 0.0, 10.0, 8.0)));
        assert_eq!(Mask::load(dir.path().join("ray-01.json")).unwrap(), mask);

        let second = session.decide(Path::new("in/ray-02.jpg")).unwrap();
        assert_eq!(second, MaskDecision::Skip);

        // end of input aborts
        let third = session.decide(Path::new("in/ray-03.jpg")).unwrap();
        assert_eq!(third, MaskDecision::Abort);

        drop(session);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("unknown command 'hello'"));
    }

    #[test]
    fn stored_session_reuses_masks() {
        let dir = tempfile::tempdir().unwrap();
        let mask = Mask::new(vec![(1.0, 1.0), (5.0, 3.0)]);
        mask.save(dir.path().join("a.json")).unwrap();

        let mut session = StoredMaskSession::new(Some(dir.path().to_owned()));
        assert_eq!(
            session.decide(Path::new("images/a.png")).unwrap(),
            MaskDecision::Save(Some(mask))
        );
        assert_eq!(
            session.decide(Path::new("images/b.png")).unwrap(),
            MaskDecision::Save(None)
        );

        let mut whole = StoredMaskSession::default();
        assert_eq!(
            whole.decide(Path::new("images/a.png")).unwrap(),
            MaskDecision::Save(None)
        );
    }
}

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Split};

use super::{EventError, EventSource, RawEvent};

type LineReader = Split<Box<dyn AsyncBufRead + Unpin + Send>>;

/// Newline-delimited JSON events read from a file or stdin.
///
/// Lines are passed on as raw bytes, so a line that is not UTF-8 still
/// reaches the parser as one bad event. Blank lines are skipped. End of input
/// exhausts the source. Acks are no-ops since a replayed file has no
/// committed position.
pub struct JsonlSource {
    lines: LineReader,
    line_no: usize,
    label: String,
}

impl JsonlSource {
    pub async fn open(path: &Path) -> Result<Self, EventError> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::from_reader(
            BufReader::new(file),
            path.display().to_string(),
        ))
    }

    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()), "stdin".to_string())
    }

    /// `-` selects stdin.
    pub async fn open_path_or_stdin(path: &Path) -> Result<Self, EventError> {
        if path.as_os_str() == "-" {
            Ok(Self::stdin())
        } else {
            Self::open(path).await
        }
    }

    pub fn from_reader<R>(reader: R, label: String) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let reader: Box<dyn AsyncBufRead + Unpin + Send> = Box::new(reader);
        Self {
            lines: reader.split(b'\n'),
            line_no: 0,
            label,
        }
    }
}

#[async_trait]
impl EventSource for JsonlSource {
    async fn next_event(&mut self) -> Result<Option<RawEvent>, EventError> {
        while let Some(mut line) = self.lines.next_segment().await? {
            self.line_no += 1;
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(RawEvent {
                payload: line,
                position: format!("{}:{}", self.label, self.line_no),
            }));
        }
        Ok(None)
    }

    async fn ack(&mut self, _event: &RawEvent) -> Result<(), EventError> {
        Ok(())
    }
}

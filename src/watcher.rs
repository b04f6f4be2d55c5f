/// Line-oriented readiness detection on a child's stdout.
///
/// [`wait_for_pattern`] reads one line at a time and stops right after the
/// first matching line, leaving everything after it in the reader for
/// [`drain`] to collect later.
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Errors produced while watching an output stream.
#[derive(Debug)]
pub enum WatchError {
    /// The stream ended before any line matched.
    PatternNotObserved { pattern: String, output: String },
    Io { source: std::io::Error },
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::PatternNotObserved { pattern, output } => write!(
                f,
                "stdout closed without a line matching {pattern:?} ({} bytes read)",
                output.len()
            ),
            WatchError::Io { source } => write!(f, "failed to read child output: {source}"),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::PatternNotObserved { .. } => None,
            WatchError::Io { source } => Some(source),
        }
    }
}

/// Read lines until one matches `pattern`.
///
/// Returns everything read so far, including the matching line and its line
/// terminator. The pattern is tested against the line without its terminator,
/// so `^...$` anchors behave as expected. No timeout is applied here.
pub async fn wait_for_pattern<R>(reader: &mut R, pattern: &Regex) -> Result<String, WatchError>
where
    R: AsyncBufRead + Unpin,
{
    let mut output = String::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| WatchError::Io { source: e })?;
        if n == 0 {
            return Err(WatchError::PatternNotObserved {
                pattern: pattern.as_str().to_string(),
                output,
            });
        }

        let line = String::from_utf8_lossy(&buf);
        tracing::debug!(line = %line.trim_end(), "expect line");
        output.push_str(&line);

        if pattern.is_match(strip_terminator(&line)) {
            tracing::debug!(pattern = %pattern, "readiness pattern matched");
            return Ok(output);
        }
    }
}

/// Read the remainder of the stream to end-of-input.
pub async fn drain<R>(reader: &mut R) -> Result<String, WatchError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| WatchError::Io { source: e })?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn strip_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn ready() -> Regex {
        Regex::new(r"^Fuse mount initialized\.$").unwrap()
    }

    #[tokio::test]
    async fn test_returns_prefix_through_matching_line() {
        let mut input: &[u8] = b"starting\nopening dev\nFuse mount initialized.\nafter\n";
        let out = wait_for_pattern(&mut input, &ready()).await.unwrap();
        assert_eq!(out, "starting\nopening dev\nFuse mount initialized.\n");
    }

    #[tokio::test]
    async fn test_does_not_consume_past_match() {
        let mut input: &[u8] = b"Fuse mount initialized.\nline two\nline three\n";
        wait_for_pattern(&mut input, &ready()).await.unwrap();

        let mut rest = String::new();
        input.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "line two\nline three\n");
    }

    #[tokio::test]
    async fn test_remainder_available_through_buffered_reader() {
        let data: &[u8] = b"a\nFuse mount initialized.\nb\nc";
        let mut reader = BufReader::new(data);
        let prefix = wait_for_pattern(&mut reader, &ready()).await.unwrap();
        let rest = drain(&mut reader).await.unwrap();
        assert_eq!(prefix, "a\nFuse mount initialized.\n");
        assert_eq!(rest, "b\nc");
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let mut input: &[u8] = b"Fuse mount initialized.\nFuse mount initialized.\n";
        let out = wait_for_pattern(&mut input, &ready()).await.unwrap();
        assert_eq!(out, "Fuse mount initialized.\n");
    }

    #[tokio::test]
    async fn test_end_of_stream_carries_accumulated_output() {
        let mut input: &[u8] = b"usage: bcachefs fusemount\nPlease supply a mountpoint.\n";
        match wait_for_pattern(&mut input, &ready()).await.unwrap_err() {
            WatchError::PatternNotObserved { pattern, output } => {
                assert_eq!(pattern, r"^Fuse mount initialized\.$");
                assert_eq!(output, "usage: bcachefs fusemount\nPlease supply a mountpoint.\n");
            }
            other => panic!("expected PatternNotObserved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_stream_fails() {
        let mut input: &[u8] = b"";
        let err = wait_for_pattern(&mut input, &ready()).await.unwrap_err();
        assert!(matches!(err, WatchError::PatternNotObserved { ref output, .. } if output.is_empty()));
    }

    #[tokio::test]
    async fn test_anchored_pattern_ignores_partial_lines() {
        let mut input: &[u8] = b"note: Fuse mount initialized. soon\nFuse mount initialized.\r\n";
        let out = wait_for_pattern(&mut input, &ready()).await.unwrap();
        assert!(out.ends_with("Fuse mount initialized.\r\n"));
        assert!(out.starts_with("note:"));
    }

    #[tokio::test]
    async fn test_unterminated_final_line_can_match() {
        let mut input: &[u8] = b"boot\nFuse mount initialized.";
        let out = wait_for_pattern(&mut input, &ready()).await.unwrap();
        assert_eq!(out, "boot\nFuse mount initialized.");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_tolerated() {
        let mut input: &[u8] = b"\xff\xfe garbage\nFuse mount initialized.\n";
        let out = wait_for_pattern(&mut input, &ready()).await.unwrap();
        assert!(out.contains('\u{FFFD}'));
    }
}

use bollard::container::LogOutput;
use bollard::query_parameters::LogsOptions;
use futures::StreamExt;
use regex::Regex;

use super::{ContainerError, ContainerManager};

/// How many trailing lines a log request returns.
const TAIL_LINES: &str = "200";

/// A single demultiplexed frame larger than this is an error — something is
/// wrong with the stream, not just a chatty container.
pub(crate) const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Total log payload cap; past this the output is truncated gracefully.
pub(crate) const MAX_TOTAL_BYTES: usize = 5 * 1024 * 1024;

impl ContainerManager {
    /// Fetch the last lines of a container's log, demultiplexed, capped,
    /// and stripped of ANSI escapes.
    pub async fn container_logs(&self, id: &str) -> Result<String, ContainerError> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: TAIL_LINES.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut buf: Vec<u8> = Vec::new();

        while let Some(frame) = stream.next().await {
            let frame = frame?;
            let bytes = frame_bytes(&frame);
            if !append_frame(&mut buf, bytes)? {
                break; // total cap reached — return what we have
            }
        }

        Ok(strip_ansi(&String::from_utf8_lossy(&buf)))
    }
}

fn frame_bytes(frame: &LogOutput) -> &[u8] {
    match frame {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    }
}

/// Append one frame under the caps. Returns false once the total cap is
/// reached; a single oversized frame is an error.
pub(crate) fn append_frame(buf: &mut Vec<u8>, frame: &[u8]) -> Result<bool, ContainerError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(ContainerError::FrameTooLarge(frame.len()));
    }
    let remaining = MAX_TOTAL_BYTES.saturating_sub(buf.len());
    if remaining == 0 {
        return Ok(false);
    }
    let take = frame.len().min(remaining);
    buf.extend_from_slice(&frame[..take]);
    Ok(take == frame.len())
}

/// Remove CSI sequences (including SGR color codes) and stray escapes.
pub(crate) fn strip_ansi(text: &str) -> String {
    // CSI: ESC [ parameters intermediates final-byte.
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| Regex::new("\u{1b}\\[[0-9;?]*[ -/]*[@-~]").expect("valid pattern"));
    re.replace_all(text, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // frame assembly
    // -----------------------------------------------------------------------

    #[test]
    fn frames_concatenate() {
        let mut buf = Vec::new();
        assert!(append_frame(&mut buf, b"Hello").unwrap());
        assert!(append_frame(&mut buf, b"World").unwrap());
        assert_eq!(buf, b"HelloWorld");
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn oversized_frame_errors() {
        let mut buf = Vec::new();
        let frame = vec![b'x'; MAX_FRAME_BYTES + 1];
        match append_frame(&mut buf, &frame) {
            Err(ContainerError::FrameTooLarge(n)) => assert_eq!(n, MAX_FRAME_BYTES + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn frame_at_cap_is_fine() {
        let mut buf = Vec::new();
        let frame = vec![b'x'; MAX_FRAME_BYTES];
        assert!(append_frame(&mut buf, &frame).unwrap());
    }

    #[test]
    fn total_cap_truncates_gracefully() {
        let mut buf = Vec::new();
        let chunk = vec![b'a'; MAX_FRAME_BYTES];
        for _ in 0..5 {
            assert!(append_frame(&mut buf, &chunk).unwrap());
        }
        // Buffer is exactly at the total cap; the next frame is dropped, not
        // an error.
        assert_eq!(buf.len(), MAX_TOTAL_BYTES);
        assert!(!append_frame(&mut buf, b"more").unwrap());
        assert_eq!(buf.len(), MAX_TOTAL_BYTES);
    }

    #[test]
    fn partial_frame_fills_to_cap() {
        let mut buf = vec![b'x'; MAX_TOTAL_BYTES - 2];
        assert!(!append_frame(&mut buf, b"abcdef").unwrap());
        assert_eq!(buf.len(), MAX_TOTAL_BYTES);
        assert_eq!(&buf[MAX_TOTAL_BYTES - 2..], b"ab");
    }

    // -----------------------------------------------------------------------
    // ansi stripping
    // -----------------------------------------------------------------------

    #[test]
    fn sgr_codes_stripped() {
        let colored = "\u{1b}[31mred\u{1b}[0m plain \u{1b}[1;32mbold green\u{1b}[0m";
        assert_eq!(strip_ansi(colored), "red plain bold green");
    }

    #[test]
    fn cursor_and_erase_sequences_stripped() {
        let text = "line\u{1b}[2K\u{1b}[1A\u{1b}[?25lrest";
        assert_eq!(strip_ansi(text), "linerest");
    }

    #[test]
    fn plain_text_untouched(){
        assert_eq!(strip_ansi("just logs\nwith lines"), "just logs\nwith lines");
    }
}

/// Parser for the transcoder's `-progress` artifact.
///
/// The transcoder appends `key=value` blocks, each ending with a
/// `progress=continue` or `progress=end` line. The file is re-read in full on
/// every poll and only newline-terminated lines are trusted, so a block that is
/// still being written never yields a torn value.

/// Value of the `progress=` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    Continue,
    End,
}

/// Latest values found in the artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ArtifactReading {
    /// Media time processed so far, in microseconds.
    pub out_time_us: Option<u64>,
    pub state: Option<ProgressState>,
}

impl ArtifactReading {
    /// Media time processed so far, in seconds.
    pub fn media_secs(&self) -> f64 {
        self.out_time_us.map(|us| us as f64 / 1_000_000.0).unwrap_or(0.0)
    }

    pub fn is_end(&self) -> bool {
        self.state == Some(ProgressState::End)
    }
}

/// Extract the last complete `out_time_ms` and `progress` values.
///
/// Despite its name `out_time_ms` is reported in microseconds; `out_time_us`
/// is accepted as a synonym. Non-numeric values such as `N/A` are skipped.
pub fn parse_progress(text: &str) -> ArtifactReading {
    let complete = match text.rfind('\n') {
        Some(idx) => &text[..idx],
        None => return ArtifactReading::default(),
    };

    let mut reading = ArtifactReading::default();
    for line in complete.lines() {
        let Some((key, value)) = line.split_once('=') else { continue };
        let value = value.trim();
        match key.trim() {
            "out_time_ms" | "out_time_us" => {
                if let Ok(us) = value.parse::<u64>() {
                    reading.out_time_us = Some(us);
                }
            }
            "progress" => match value {
                "continue" => reading.state = Some(ProgressState::Continue),
                "end" => reading.state = Some(ProgressState::End),
                _ => {}
            },
            _ => {}
        }
    }
    reading
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_artifact() {
        let reading = parse_progress("");
        assert_eq!(reading, ArtifactReading::default());
        assert_eq!(reading.media_secs(), 0.0);
        assert!(!reading.is_end());
    }

    #[test]
    fn test_successive_blocks_take_latest() {
        let first = "frame=10\nout_time_ms=5000000\nprogress=continue\n";
        let reading = parse_progress(first);
        assert_eq!(reading.media_secs(), 5.0);
        assert_eq!(reading.state, Some(ProgressState::Continue));

        let both = format!("{}frame=20\nout_time_ms=10000000\nprogress=end\n", first);
        let reading = parse_progress(&both);
        assert_eq!(reading.media_secs(), 10.0);
        assert!(reading.is_end());
    }

    #[test]
    fn test_torn_line_is_ignored() {
        let text = "out_time_ms=5000000\nprogress=continue\nout_time_ms=99";
        let reading = parse_progress(text);
        assert_eq!(reading.out_time_us, Some(5_000_000));

        let text = "out_time_ms=5000000\nprogress=continue\nprogress=en";
        assert_eq!(parse_progress(text).state, Some(ProgressState::Continue));
    }

    #[test]
    fn test_not_available_values_are_skipped() {
        let text = "out_time_ms=2500000\nprogress=continue\nout_time_ms=N/A\nprogress=continue\n";
        assert_eq!(parse_progress(text).media_secs(), 2.5);
    }

    #[test]
    fn test_out_time_us_synonym() {
        let text = "out_time_us=1500000\nprogress=continue\n";
        assert_eq!(parse_progress(text).media_secs(), 1.5);
    }
}

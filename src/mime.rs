//! Content-type lookup table.
//!
//! Extensions are stored reversed (`"lmth."` for `.html`) so the lookup
//! walks the filename and the entry in lockstep from their ends. The
//! longest matching suffix wins, which lets `.tar.gz`-style compound
//! extensions shadow their tails.

pub const FALLBACK: &str = "application/octet-stream";

pub struct MimeTable {
    entries: Vec<(&'static str, &'static str)>,
}

impl MimeTable {
    pub fn new(entries: Vec<(&'static str, &'static str)>) -> Self {
        Self { entries }
    }

    /// Longest reversed-suffix match over the table; unknown names fall
    /// back to `application/octet-stream`.
    pub fn lookup(&self, name: &str) -> &'static str {
        let name = name.as_bytes();
        let mut best: Option<(&'static str, usize)> = None;

        for (rev, ty) in &self.entries {
            let rev = rev.as_bytes();
            if rev.len() > name.len() {
                continue;
            }
            let tail = name[name.len() - rev.len()..].iter().rev();
            if rev
                .iter()
                .zip(tail)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
                && best.map_or(true, |(_, len)| rev.len() > len)
            {
                best = Some((ty, rev.len()));
            }
        }

        best.map(|(ty, _)| ty).unwrap_or(FALLBACK)
    }
}

impl Default for MimeTable {
    fn default() -> Self {
        // The control panel's asset palette plus the audio types the
        // player's disk shares expose.
        Self::new(vec![
            ("lmth.", "text/html"),
            ("mth.", "text/html"),
            ("ssc.", "text/css"),
            ("sj.", "text/javascript"),
            ("nosj.", "application/json"),
            ("gvs.", "image/svg+xml"),
            ("gnp.", "image/png"),
            ("gpj.", "image/jpeg"),
            ("gepj.", "image/jpeg"),
            ("oci.", "image/x-icon"),
            ("txt.", "text/plain"),
            ("lmx.", "application/xml"),
            ("msaw.", "application/wasm"),
            ("3pm.", "audio/mpeg"),
            ("ggo.", "audio/ogg"),
            ("calf.", "audio/flac"),
            ("vaw.", "audio/wav"),
            ("u3m.", "audio/x-mpegurl"),
        ])
    }
}

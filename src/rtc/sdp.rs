//! Answer SDP post-processing
//!
//! The transport generates a perfectly valid answer, but browsers only
//! decode Opus in stereo at full quality when the answer's `a=fmtp` line
//! asks for it. This rewrites (or adds) that line.

use crate::constants::{DEFAULT_BITRATE, FRAME_DURATION_MS};

/// Shortest packetization interval we accept
const MIN_PTIME_MS: u32 = 10;

/// Opus parameters requested in the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSdpParams {
    pub sample_rate: u32,
    pub max_average_bitrate: u32,
    pub ptime_ms: u32,
    pub min_ptime_ms: u32,
}

impl AudioSdpParams {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            max_average_bitrate: DEFAULT_BITRATE,
            ptime_ms: FRAME_DURATION_MS,
            min_ptime_ms: MIN_PTIME_MS,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.max_average_bitrate = bitrate;
        self
    }
}

/// Ordered `key=value` list from an fmtp line
#[derive(Debug, Default, PartialEq)]
struct FmtpParams(Vec<(String, String)>);

impl FmtpParams {
    fn parse(payload: &str) -> Self {
        let params = payload
            .trim_start_matches([' ', ';'])
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (part.to_string(), "1".to_string()),
            })
            .collect();
        Self(params)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Replace in place, or append if absent
    fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    fn apply(&mut self, params: &AudioSdpParams) {
        let fec = self.get("useinbandfec").unwrap_or("1").to_string();
        self.set("stereo", "1");
        self.set("sprop-stereo", "1");
        self.set("maxaveragebitrate", params.max_average_bitrate.to_string());
        self.set("maxplaybackrate", params.sample_rate.to_string());
        self.set("ptime", params.ptime_ms.to_string());
        self.set("minptime", params.min_ptime_ms.to_string());
        self.set("useinbandfec", fec);
    }

    fn render(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Payload type of the Opus codec, from its `a=rtpmap` line
fn find_opus_payload_type(sdp: &str) -> Option<&str> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=rtpmap:"))
        .find(|rest| rest.to_ascii_lowercase().contains("opus/48000"))
        .and_then(|rest| rest.split_whitespace().next())
}

/// Request stereo, bitrate and packetization on the Opus fmtp line.
///
/// Returns the input untouched if the SDP carries no Opus codec.
pub fn patch_answer(sdp: &str, params: &AudioSdpParams) -> String {
    let Some(pt) = find_opus_payload_type(sdp) else {
        return sdp.to_string();
    };
    let fmtp_prefix = format!("a=fmtp:{}", pt);
    let rtpmap_prefix = format!("a=rtpmap:{}", pt);
    let mut lines: Vec<String> = sdp.lines().map(str::to_string).collect();

    let fmtp_idx = lines
        .iter()
        .position(|line| is_attribute_for(line, &fmtp_prefix));

    match fmtp_idx {
        Some(idx) => {
            let mut fmtp = FmtpParams::parse(&lines[idx][fmtp_prefix.len()..]);
            fmtp.apply(params);
            lines[idx] = format!("{} {}", fmtp_prefix, fmtp.render());
        }
        None => {
            let mut fmtp = FmtpParams::default();
            fmtp.apply(params);
            let line = format!("{} {}", fmtp_prefix, fmtp.render());
            match lines
                .iter()
                .position(|line| is_attribute_for(line, &rtpmap_prefix))
            {
                Some(idx) => lines.insert(idx + 1, line),
                None => lines.push(line),
            }
        }
    }

    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}

/// `a=fmtp:111 ...` matches prefix `a=fmtp:111` but `a=fmtp:1110` does not
fn is_attribute_for(line: &str, prefix: &str) -> bool {
    line.strip_prefix(prefix)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANSWER: &str = "v=0\r\n\
        o=- 1 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
        a=rtpmap:111 opus/48000/2\r\n\
        a=fmtp:111 minptime=10;useinbandfec=1\r\n\
        a=rtpmap:0 PCMU/8000\r\n";

    fn fmtp_line(sdp: &str) -> &str {
        sdp.lines().find(|l| l.starts_with("a=fmtp:111")).unwrap()
    }

    #[test]
    fn test_existing_fmtp_is_extended_in_place() {
        let patched = patch_answer(ANSWER, &AudioSdpParams::new(48000));
        assert_eq!(
            fmtp_line(&patched),
            "a=fmtp:111 minptime=10;useinbandfec=1;stereo=1;sprop-stereo=1;\
             maxaveragebitrate=256000;maxplaybackrate=48000;ptime=20"
        );
        assert!(patched.ends_with("\r\n"));
        assert_eq!(patched.lines().count(), ANSWER.lines().count());
    }

    #[test]
    fn test_missing_fmtp_is_inserted_after_rtpmap() {
        let answer = ANSWER.replace("a=fmtp:111 minptime=10;useinbandfec=1\r\n", "");
        let patched = patch_answer(&answer, &AudioSdpParams::new(44100));
        let lines: Vec<&str> = patched.lines().collect();
        let rtpmap = lines.iter().position(|l| l.starts_with("a=rtpmap:111")).unwrap();
        assert_eq!(
            lines[rtpmap + 1],
            "a=fmtp:111 stereo=1;sprop-stereo=1;maxaveragebitrate=256000;\
             maxplaybackrate=44100;ptime=20;minptime=10;useinbandfec=1"
        );
    }

    #[test]
    fn test_existing_fec_choice_is_kept() {
        let answer = ANSWER.replace("useinbandfec=1", "useinbandfec=0;usedtx");
        let patched = patch_answer(&answer, &AudioSdpParams::new(48000));
        let line = fmtp_line(&patched);
        assert!(line.contains("useinbandfec=0"));
        assert!(line.contains("usedtx=1"));
    }

    #[test]
    fn test_bitrate_override() {
        let patched = patch_answer(ANSWER, &AudioSdpParams::new(48000).with_bitrate(128_000));
        assert!(fmtp_line(&patched).contains("maxaveragebitrate=128000"));
    }

    #[test]
    fn test_without_opus_is_unchanged() {
        let answer = "v=0\r\nm=audio 9 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        assert_eq!(patch_answer(answer, &AudioSdpParams::new(48000)), answer);
    }

    #[test]
    fn test_patch_is_idempotent() {
        let params = AudioSdpParams::new(48000);
        let once = patch_answer(ANSWER, &params);
        assert_eq!(patch_answer(&once, &params), once);
    }

    #[test]
    fn test_payload_type_prefix_is_exact() {
        let answer = ANSWER.replace("a=rtpmap:0 PCMU/8000", "a=fmtp:1110 foo=bar");
        let patched = patch_answer(&answer, &AudioSdpParams::new(48000));
        assert!(patched.contains("a=fmtp:1110 foo=bar"));
    }
}

//! Pure text transforms applied to a session description before it is
//! sent back as an answer. Both transforms are line-local, deterministic
//! and idempotent; unrelated lines pass through byte-for-byte.

use crate::config::Capabilities;

/// Codec-parameter line of the Opus payload type negotiated by default.
const OPUS_FMTP_PREFIX: &str = "a=fmtp:111";

/// Extension-mapping line the congestion-control mapping is anchored to.
const ANCHOR_EXTMAP_PREFIX: &str = "a=extmap:2 ";

const TWCC_EXTMAP_LINE: &str =
    "a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";

/// Force single-channel Opus operation (RFC 7587 §6.1): rewrite
/// `stereo=1` to `stereo=0` on the codec-parameter line, or append the
/// parameter when it is missing.
pub fn prefer_mono(sdp: &str) -> String {
    sdp.split("\r\n")
        .map(|line| {
            if line.starts_with(OPUS_FMTP_PREFIX) {
                if line.contains("stereo=") {
                    line.replace("stereo=1", "stereo=0")
                } else {
                    format!("{line};stereo=0")
                }
            } else {
                line.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// Advertise transport-wide congestion control by appending a second
/// extension mapping directly after the anchor mapping. No-op when the
/// anchor is absent or the mapping is already advertised.
pub fn add_twcc(sdp: &str) -> String {
    if sdp.split("\r\n").any(|line| line == TWCC_EXTMAP_LINE) {
        return sdp.to_owned();
    }
    sdp.split("\r\n")
        .map(|line| {
            if line.starts_with(ANCHOR_EXTMAP_PREFIX) {
                format!("{line}\r\n{TWCC_EXTMAP_LINE}")
            } else {
                line.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\r\n")
}

/// The full answer pipeline: mono downmix always, congestion-control
/// injection only when the capability descriptor enables it.
pub fn process(sdp: &str, capabilities: &Capabilities) -> String {
    let output = prefer_mono(sdp);
    if capabilities.twcc {
        add_twcc(&output)
    } else {
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WITH_STEREO: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10;stereo=1;useinbandfec=1\r\na=ssrc:1 cname:x";
    const WITHOUT_STEREO: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10;useinbandfec=1\r\na=ssrc:1 cname:x";

    #[test]
    fn rewrites_stereo_parameter() {
        let output = prefer_mono(WITH_STEREO);
        assert!(output.contains("a=fmtp:111 minptime=10;stereo=0;useinbandfec=1"));
        assert!(!output.contains("stereo=1"));
    }

    #[test]
    fn appends_stereo_parameter_when_missing() {
        let output = prefer_mono(WITHOUT_STEREO);
        assert!(output.contains("a=fmtp:111 minptime=10;useinbandfec=1;stereo=0"));
    }

    #[test]
    fn prefer_mono_is_idempotent() {
        for input in [WITH_STEREO, WITHOUT_STEREO] {
            let once = prefer_mono(input);
            assert_eq!(prefer_mono(&once), once);
        }
    }

    #[test]
    fn unrelated_lines_pass_through_unchanged() {
        let output = prefer_mono(WITH_STEREO);
        let untouched: Vec<_> = WITH_STEREO
            .split("\r\n")
            .filter(|line| !line.starts_with("a=fmtp:111"))
            .collect();
        for line in untouched {
            assert!(output.split("\r\n").any(|l| l == line), "lost line {line}");
        }
    }

    #[test]
    fn no_opus_fmtp_line_means_no_change() {
        let sdp = "v=0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\na=fmtp:96 max-fr=30";
        assert_eq!(prefer_mono(sdp), sdp);
    }

    #[test]
    fn twcc_mapping_follows_the_anchor_line() {
        let sdp = "a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\na=extmap:2 urn:ietf:params:rtp-hdrext:toffset\r\na=sendrecv";
        let output = add_twcc(sdp);
        let lines: Vec<_> = output.split("\r\n").collect();
        let anchor = lines
            .iter()
            .position(|line| line.starts_with("a=extmap:2 "))
            .unwrap();
        assert_eq!(lines[anchor + 1], "a=extmap:3 http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01");
    }

    #[test]
    fn add_twcc_is_idempotent() {
        let sdp = "a=extmap:2 urn:ietf:params:rtp-hdrext:toffset\r\na=sendrecv";
        let once = add_twcc(sdp);
        assert_eq!(add_twcc(&once), once);
    }

    #[test]
    fn add_twcc_without_anchor_is_a_no_op() {
        let sdp = "a=extmap:1 urn:ietf:params:rtp-hdrext:ssrc-audio-level\r\na=sendrecv";
        assert_eq!(add_twcc(sdp), sdp);
    }

    #[test]
    fn process_honors_the_capability_descriptor() {
        let caps_off = Capabilities { twcc: false, ..Default::default() };
        let caps_on = Capabilities { twcc: true, ..Default::default() };
        let sdp = "a=extmap:2 urn:ietf:params:rtp-hdrext:toffset\r\na=fmtp:111 minptime=10";
        assert!(!process(sdp, &caps_off).contains("transport-wide-cc"));
        assert!(process(sdp, &caps_on).contains("transport-wide-cc"));
    }
}

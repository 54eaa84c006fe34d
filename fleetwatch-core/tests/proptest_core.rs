//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use fleetwatch_core::cache::is_duplicate;
use fleetwatch_core::summarizer::{IDLE_SUMMARY, parse_summary_response};
use fleetwatch_core::transcript::{TranscriptReader, fingerprint, mangle_project_key};

// --- Project directory containment ---

fn key_segment() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("..".to_string()),
        Just(".".to_string()),
        Just(String::new()),
        "[a-zA-Z0-9_-]{1,8}",
    ]
}

proptest! {
    #[test]
    fn project_dir_never_escapes_base(
        segments in prop::collection::vec(key_segment(), 0..8),
        sep in prop_oneof![Just("/"), Just("\\")],
        absolute in any::<bool>(),
    ) {
        let reader = TranscriptReader::new("/srv/transcripts", 10);
        let mut key = segments.join(sep);
        if absolute {
            key.insert_str(0, sep);
        }
        let dir = reader.project_dir(&key);
        prop_assert!(dir.starts_with("/srv/transcripts"));
        prop_assert_ne!(dir.as_path(), std::path::Path::new("/srv/transcripts"));
    }

    #[test]
    fn mangled_path_keys_have_no_separators(path in "(/[a-z.]{1,6}){1,5}") {
        let mangled = mangle_project_key(&path);
        prop_assert!(!mangled.contains('/'));
        prop_assert!(!mangled.contains('.'));
        prop_assert_eq!(mangled.len(), path.len());
    }
}

// --- Summary response parsing ---

proptest! {
    #[test]
    fn parse_is_total(text in "\\PC{0,300}") {
        let (summary, delta) = parse_summary_response(&text);
        prop_assert!(!summary.is_empty());
        prop_assert_eq!(summary.trim(), summary.as_str());
        prop_assert_eq!(delta.trim(), delta.as_str());
        if text.trim().is_empty() {
            prop_assert_eq!(summary.as_str(), IDLE_SUMMARY);
        }
    }

    #[test]
    fn parse_reads_labelled_lines(
        summary in "[A-Za-z][A-Za-z ]{0,40}[A-Za-z]",
        delta in "[A-Za-z][A-Za-z ]{0,40}[A-Za-z]",
    ) {
        let text = format!("SUMMARY: {summary}\nDELTA: {delta}\n");
        let (s, d) = parse_summary_response(&text);
        prop_assert_eq!(s, summary);
        prop_assert_eq!(d, delta);
    }
}

// --- Fingerprints and duplicate detection ---

proptest! {
    #[test]
    fn fingerprint_is_hex_sha256(content in "\\PC{0,200}") {
        let fp = fingerprint(&content);
        prop_assert_eq!(fp.len(), 64);
        prop_assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        prop_assert_eq!(fp, fingerprint(&content));
    }

    #[test]
    fn never_duplicate_without_previous(summary in "\\PC{0,80}", delta in "\\PC{0,80}") {
        prop_assert!(!is_duplicate(None, &summary, &delta));
    }

    #[test]
    fn same_summary_modulo_case_is_duplicate(summary in "[a-zA-Z ]{1,60}") {
        let shouted = format!("  {}  ", summary.to_uppercase());
        prop_assert!(is_duplicate(Some(&summary), &shouted, "Moved on"));
    }
}

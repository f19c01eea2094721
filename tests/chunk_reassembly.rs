//! Property-based coverage of the chunker's overlap contract (spec.md §4.2
//! step 3, §8 "Testable Properties"): for arbitrary whitespace-free input,
//! dropping each non-first chunk's leading `chunk_overlap_chars` and
//! concatenating everything reproduces the input exactly. Whitespace-free
//! input sidesteps the one genuine ambiguity in "modulo whitespace
//! normalization" — that each chunk's content is `str::trim`-med, so a cut
//! landing on a space could otherwise shift chunk boundaries by a
//! non-deterministic amount.

use proptest::prelude::*;
use rag_engine::chunker::{chunk_markdown, ChunkerConfig};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn overlap_windows_reassemble_the_original_input(
        input in "[a-z0-9]{0,3000}",
        chunk_size in 50usize..=400,
        overlap_pct in 0usize..=40,
    ) {
        let config = ChunkerConfig {
            chunk_size_chars: chunk_size,
            chunk_overlap_chars: (chunk_size * overlap_pct) / 100,
        };
        let chunks = chunk_markdown(&input, config);

        if input.is_empty() {
            prop_assert!(chunks.is_empty());
            return Ok(());
        }

        let mut reconstructed = chunks[0].content.clone();
        for pair in chunks.windows(2) {
            let skip = config.chunk_overlap_chars.min(pair[1].content.chars().count());
            reconstructed.extend(pair[1].content.chars().skip(skip));
        }

        prop_assert_eq!(reconstructed, input);
    }

    /// The property above only ever reaches the oversized-single-paragraph
    /// fallback: its whitespace-free alphabet never contains `"\n\n"`, so
    /// `split_into_sections` sees one section and `split_by_paragraph` sees
    /// one paragraph. This property instead joins several whitespace-free
    /// paragraphs with blank lines, forcing multiple paragraph groups, and
    /// checks the weaker (but trim-safe) boundary-sharing half of the same
    /// contract: every chunk after the first starts with the last
    /// `chunk_overlap_chars` characters of its predecessor. Full-input
    /// reconstruction isn't asserted here — the blank-line separators
    /// between paragraph groups aren't themselves carried into any chunk, so
    /// reconstructing the literal input would require accounting for them
    /// separately — but a missing or short boundary overlap still fails this
    /// check exactly like it fails the property above.
    #[test]
    fn grouped_paragraph_chunks_share_boundary_text(
        paragraphs in proptest::collection::vec("[a-z0-9]{1,200}", 1usize..10),
        chunk_size in 200usize..=1200,
        overlap_pct in 1usize..=40,
    ) {
        let body = paragraphs.join("\n\n");
        let config = ChunkerConfig {
            chunk_size_chars: chunk_size,
            chunk_overlap_chars: (chunk_size * overlap_pct) / 100,
        };
        let chunks = chunk_markdown(&body, config);

        for pair in chunks.windows(2) {
            let overlap = config.chunk_overlap_chars.min(pair[0].content.chars().count());
            let prev_tail: String = pair[0].content.chars().rev().take(overlap).collect::<Vec<_>>().into_iter().rev().collect();
            prop_assert!(pair[1].content.starts_with(&prev_tail));
        }
    }
}

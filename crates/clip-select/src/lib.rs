//! # Clip Select
//!
//! Selects representative audio clips per speaker from a diarized transcript.
//!
//! Given per-segment `(speaker, start, end)` tuples, this crate ranks
//! candidate time ranges per speaker and maintains a rotatable "current
//! pick". Segments spoken over by another speaker are avoided when a clean
//! alternative exists, since solo audio produces better voice profiles.
//!
//! The selection state ([`ClipSelection`]) is serde-serializable so a caller
//! can persist it alongside job results and keep re-picks deterministic
//! across restarts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Minimum preferred clip duration in seconds.
pub const MIN_CLIP_SECS: f64 = 15.0;

/// Maximum preferred clip duration in seconds.
pub const MAX_CLIP_SECS: f64 = 30.0;

/// Maximum number of candidates kept per speaker.
pub const MAX_CANDIDATES: usize = 5;

/// Tolerance when matching two segments by their start/end times.
const MATCH_TOLERANCE_SECS: f64 = 1e-3;

/// A diarized transcript segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Speaker tag, e.g. `SPEAKER0`.
    pub speaker: String,
    /// Segment start in seconds.
    pub start: f64,
    /// Segment end in seconds.
    pub end: f64,
}

impl TranscriptSegment {
    pub fn new(speaker: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            speaker: speaker.into(),
            start,
            end,
        }
    }
}

/// A candidate time range for a speaker reference clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipCandidate {
    pub speaker: String,
    pub start: f64,
    pub end: f64,
    pub duration: f64,
}

impl ClipCandidate {
    fn from_segment(segment: &TranscriptSegment) -> Self {
        Self {
            speaker: segment.speaker.clone(),
            start: segment.start,
            end: segment.end,
            duration: segment.end - segment.start,
        }
    }

    fn matches(&self, other: &ClipCandidate) -> bool {
        (self.start - other.start).abs() < MATCH_TOLERANCE_SECS
            && (self.end - other.end).abs() < MATCH_TOLERANCE_SECS
    }
}

/// Ranked candidates and the current pick per speaker.
///
/// `selected` holds an index into the corresponding candidate list. Both maps
/// are persisted together, which keeps [`ClipSelection::advance`] a stable
/// round-robin over process restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipSelection {
    /// Candidate lists keyed by speaker tag, ranked by duration descending.
    pub candidates: HashMap<String, Vec<ClipCandidate>>,
    /// Index of the currently selected candidate per speaker.
    pub selected: HashMap<String, usize>,
}

impl ClipSelection {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Speaker tags in deterministic order (numeric tag suffix ascending,
    /// tags without a suffix first).
    pub fn speakers(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.candidates.keys().map(String::as_str).collect();
        tags.sort_by_key(|tag| (speaker_sort_key(tag), tag.to_string()));
        tags
    }

    /// The currently selected candidate for a speaker, if any.
    pub fn current(&self, speaker: &str) -> Option<&ClipCandidate> {
        let index = *self.selected.get(speaker)?;
        self.candidates.get(speaker)?.get(index)
    }

    /// Advance the round-robin pointer for a speaker and return the newly
    /// selected candidate.
    ///
    /// Cycles through the fixed candidate list: calling this `len` times
    /// returns to the original selection.
    pub fn advance(&mut self, speaker: &str) -> Option<&ClipCandidate> {
        let candidates = self.candidates.get(speaker)?;
        if candidates.is_empty() {
            return None;
        }
        let current = self.selected.get(speaker).copied().unwrap_or(0);
        let next = (current + 1) % candidates.len();
        self.selected.insert(speaker.to_string(), next);
        candidates.get(next)
    }
}

/// Sort key for a speaker tag: the integer suffix (the `3` in `SPEAKER3`),
/// or 0 when the tag carries no numeric suffix.
pub fn speaker_sort_key(tag: &str) -> u32 {
    let digits: String = tag
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .chars()
        .rev()
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

fn segments_overlap(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> bool {
    !(a_end <= b_start || b_end <= a_start)
}

/// Build ranked clip candidates per speaker.
///
/// For each speaker the non-overlapping pool (segments with no temporal
/// overlap against any other speaker's segment) is preferred; when it is
/// empty all of the speaker's segments are considered. The pool is ranked by
/// duration descending and capped at [`MAX_CANDIDATES`], with one guarantee:
/// the segment closest to the ideal target duration always survives the cap,
/// replacing the shortest ranked candidate when it would otherwise fall off.
///
/// Zero-length and inverted segments are discarded up front. Speakers with
/// no usable segments are absent from the result.
pub fn build_candidates(segments: &[TranscriptSegment]) -> HashMap<String, Vec<ClipCandidate>> {
    let valid: Vec<&TranscriptSegment> = segments.iter().filter(|s| s.end > s.start).collect();

    let mut grouped: HashMap<&str, Vec<&TranscriptSegment>> = HashMap::new();
    for segment in &valid {
        grouped.entry(segment.speaker.as_str()).or_default().push(segment);
    }

    let target = (MIN_CLIP_SECS + MAX_CLIP_SECS) / 2.0;
    let mut candidates: HashMap<String, Vec<ClipCandidate>> = HashMap::new();

    for (speaker, own) in &grouped {
        let all: Vec<ClipCandidate> = own.iter().map(|s| ClipCandidate::from_segment(s)).collect();
        let non_overlap: Vec<ClipCandidate> = all
            .iter()
            .filter(|entry| {
                !valid.iter().any(|other| {
                    other.speaker != *speaker
                        && segments_overlap(entry.start, entry.end, other.start, other.end)
                })
            })
            .cloned()
            .collect();

        let mut pool = if non_overlap.is_empty() { all } else { non_overlap };
        if pool.is_empty() {
            continue;
        }

        pool.sort_by(|a, b| b.duration.total_cmp(&a.duration));
        let mut chosen: Vec<ClipCandidate> = pool.iter().take(MAX_CANDIDATES).cloned().collect();

        // Guarantee an ideal-length option even when duration ranking would
        // exclude it.
        let closest = pool
            .iter()
            .min_by(|a, b| {
                (a.duration - target)
                    .abs()
                    .total_cmp(&(b.duration - target).abs())
            })
            .cloned();
        if let Some(closest) = closest
            && !chosen.iter().any(|c| c.matches(&closest))
        {
            if chosen.len() < MAX_CANDIDATES {
                chosen.push(closest);
            } else if let Some(last) = chosen.last_mut() {
                *last = closest;
            }
        }

        candidates.insert((*speaker).to_string(), chosen);
    }

    candidates
}

/// Pick the default representative candidate: within the preferred duration
/// window the one closest to the target, otherwise the single longest.
///
/// Returns an index into `candidates`, or `None` when the list is empty.
pub fn pick_representative(candidates: &[ClipCandidate]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let target = (MIN_CLIP_SECS + MAX_CLIP_SECS) / 2.0;
    let in_window = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| (MIN_CLIP_SECS..=MAX_CLIP_SECS).contains(&c.duration))
        .min_by(|(_, a), (_, b)| {
            (a.duration - target)
                .abs()
                .total_cmp(&(b.duration - target).abs())
        })
        .map(|(i, _)| i);
    if in_window.is_some() {
        return in_window;
    }
    candidates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.duration.total_cmp(&b.duration))
        .map(|(i, _)| i)
}

/// Build the full selection state for a transcript: ranked candidates plus
/// the default representative pick per speaker.
pub fn build_selection(segments: &[TranscriptSegment]) -> ClipSelection {
    let candidates = build_candidates(segments);
    let selected = candidates
        .iter()
        .filter_map(|(speaker, list)| {
            pick_representative(list).map(|index| (speaker.clone(), index))
        })
        .collect();
    ClipSelection {
        candidates,
        selected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seg(speaker: &str, start: f64, end: f64) -> TranscriptSegment {
        TranscriptSegment::new(speaker, start, end)
    }

    #[test]
    fn empty_transcript_yields_empty_selection() {
        let selection = build_selection(&[]);
        assert!(selection.is_empty());
        assert!(selection.selected.is_empty());
    }

    #[test]
    fn degenerate_segments_are_discarded() {
        let selection = build_selection(&[
            seg("SPEAKER0", 10.0, 10.0),
            seg("SPEAKER0", 20.0, 5.0),
        ]);
        assert!(selection.candidates.get("SPEAKER0").is_none());
    }

    #[test]
    fn overlapping_segment_is_excluded_when_clean_audio_exists() {
        // A: 0-20 overlaps B's 5-15, so A's non-overlapping pool is only
        // 30-55 (25s), which becomes the pick despite exceeding the
        // preferred window.
        let selection = build_selection(&[
            seg("SPEAKER0", 0.0, 20.0),
            seg("SPEAKER1", 5.0, 15.0),
            seg("SPEAKER0", 30.0, 55.0),
        ]);
        let a = &selection.candidates["SPEAKER0"];
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].start, 30.0);
        assert_eq!(a[0].end, 55.0);
        let picked = selection.current("SPEAKER0").unwrap();
        assert_eq!(picked.duration, 25.0);
    }

    #[test]
    fn touching_segments_do_not_overlap() {
        let selection = build_selection(&[
            seg("SPEAKER0", 0.0, 20.0),
            seg("SPEAKER1", 20.0, 40.0),
        ]);
        // Back-to-back turns count as clean audio for both speakers.
        assert_eq!(selection.candidates["SPEAKER0"].len(), 1);
        assert_eq!(selection.candidates["SPEAKER1"].len(), 1);
    }

    #[test]
    fn falls_back_to_all_segments_when_everything_overlaps() {
        let selection = build_selection(&[
            seg("SPEAKER0", 0.0, 20.0),
            seg("SPEAKER1", 5.0, 15.0),
        ]);
        assert_eq!(selection.candidates["SPEAKER0"].len(), 1);
        assert_eq!(selection.candidates["SPEAKER1"].len(), 1);
    }

    #[test]
    fn default_pick_prefers_closest_to_target_within_window() {
        // Durations 12s, 22s, 35s: only 22s is inside [15, 30] and it is
        // also the closest to the 22.5s target.
        let selection = build_selection(&[
            seg("SPEAKER0", 0.0, 12.0),
            seg("SPEAKER0", 20.0, 42.0),
            seg("SPEAKER0", 50.0, 85.0),
        ]);
        let picked = selection.current("SPEAKER0").unwrap();
        assert_eq!(picked.duration, 22.0);
    }

    #[test]
    fn default_pick_falls_back_to_longest_outside_window() {
        let selection = build_selection(&[
            seg("SPEAKER0", 0.0, 5.0),
            seg("SPEAKER0", 10.0, 20.0),
        ]);
        let picked = selection.current("SPEAKER0").unwrap();
        assert_eq!(picked.duration, 10.0);
    }

    #[test]
    fn candidates_are_ranked_by_duration_descending_and_capped() {
        let segments: Vec<TranscriptSegment> = (0..7)
            .map(|i| {
                let start = i as f64 * 200.0;
                seg("SPEAKER0", start, start + 40.0 + i as f64)
            })
            .collect();
        let candidates = &build_candidates(&segments)["SPEAKER0"];
        assert_eq!(candidates.len(), MAX_CANDIDATES);
        for pair in candidates.windows(2) {
            assert!(pair[0].duration >= pair[1].duration);
        }
    }

    #[test]
    fn target_duration_candidate_survives_the_cap() {
        // Five long segments dominate the ranking; the 23s segment is the
        // closest to target and must replace the shortest ranked candidate.
        let mut segments: Vec<TranscriptSegment> = (0..5)
            .map(|i| {
                let start = i as f64 * 500.0;
                seg("SPEAKER0", start, start + 100.0 - i as f64 * 10.0)
            })
            .collect();
        segments.push(seg("SPEAKER0", 3000.0, 3023.0));
        let candidates = &build_candidates(&segments)["SPEAKER0"];
        assert_eq!(candidates.len(), MAX_CANDIDATES);
        assert!(candidates.iter().any(|c| c.duration == 23.0));
        // The shortest of the original top five (60s) fell off.
        assert!(!candidates.iter().any(|c| c.duration == 60.0));
    }

    #[test]
    fn advance_cycles_back_to_the_original_pick() {
        let segments: Vec<TranscriptSegment> = (0..4)
            .map(|i| {
                let start = i as f64 * 100.0;
                seg("SPEAKER0", start, start + 16.0 + i as f64 * 4.0)
            })
            .collect();
        let mut selection = build_selection(&segments);
        let original = selection.current("SPEAKER0").unwrap().clone();
        let len = selection.candidates["SPEAKER0"].len();
        for _ in 0..len {
            selection.advance("SPEAKER0");
        }
        assert_eq!(selection.current("SPEAKER0").unwrap(), &original);
    }

    #[test]
    fn advance_on_unknown_speaker_returns_none() {
        let mut selection = build_selection(&[seg("SPEAKER0", 0.0, 20.0)]);
        assert!(selection.advance("SPEAKER9").is_none());
    }

    #[rstest]
    #[case("SPEAKER0", 0)]
    #[case("SPEAKER3", 3)]
    #[case("SPEAKER12", 12)]
    #[case("HOST", 0)]
    fn sort_key_uses_numeric_suffix(#[case] tag: &str, #[case] expected: u32) {
        assert_eq!(speaker_sort_key(tag), expected);
    }

    #[test]
    fn speakers_are_ordered_by_tag_suffix() {
        let selection = build_selection(&[
            seg("SPEAKER10", 0.0, 20.0),
            seg("SPEAKER2", 100.0, 120.0),
            seg("HOST", 200.0, 220.0),
        ]);
        assert_eq!(selection.speakers(), vec!["HOST", "SPEAKER2", "SPEAKER10"]);
    }

    #[test]
    fn selection_state_round_trips_through_json() {
        let mut selection = build_selection(&[
            seg("SPEAKER0", 0.0, 20.0),
            seg("SPEAKER0", 100.0, 125.0),
        ]);
        selection.advance("SPEAKER0");
        let restored: ClipSelection =
            serde_json::from_str(&serde_json::to_string(&selection).unwrap()).unwrap();
        assert_eq!(restored.selected, selection.selected);
        assert_eq!(
            restored.current("SPEAKER0").unwrap(),
            selection.current("SPEAKER0").unwrap()
        );
    }
}

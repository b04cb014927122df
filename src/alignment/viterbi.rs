use crate::error::{ConversionError, Result};
use crate::types::DecisionPath;

/// Frames needed to emit `targets`: one per label plus a separating blank
/// between each pair of identical neighbours.
pub fn min_frames_for(targets: &[usize]) -> usize {
    let repeats = targets.windows(2).filter(|w| w[0] == w[1]).count();
    targets.len() + repeats
}

/// `[blank, t0, blank, t1, ..., blank]`
fn expand_with_blanks(targets: &[usize], blank: usize) -> Vec<usize> {
    let mut states = Vec::with_capacity(targets.len() * 2 + 1);
    states.push(blank);
    for &t in targets {
        states.push(t);
        states.push(blank);
    }
    states
}

/// CTC Viterbi forced alignment on the CPU.
///
/// Returns one label per frame (blank or a target label) and the summed
/// log-probability of the chosen path. Fails when the rows differ in length,
/// the frames cannot fit the targets, or a target is outside the vocabulary.
pub fn forced_align_viterbi(
    log_probs: &[Vec<f32>],
    targets: &[usize],
    blank: usize,
) -> Result<DecisionPath> {
    let t_len = log_probs.len();
    if t_len == 0 {
        return Err(ConversionError::invalid_input("cannot align zero frames"));
    }
    let vocab = log_probs[0].len();
    if let Some((frame, row)) = log_probs.iter().enumerate().find(|(_, row)| row.len() != vocab) {
        return Err(ConversionError::invalid_input(format!(
            "frame {frame} has {} log-probabilities, frame 0 has {vocab}",
            row.len()
        )));
    }
    if let Some(&bad) = targets.iter().chain(std::iter::once(&blank)).find(|&&t| t >= vocab) {
        return Err(ConversionError::invalid_input(format!(
            "label {bad} is outside the vocabulary of {vocab}"
        )));
    }
    let needed = min_frames_for(targets);
    if t_len < needed {
        return Err(ConversionError::invalid_input(format!(
            "{t_len} frames cannot hold {} targets ({needed} frames required)",
            targets.len()
        )));
    }

    let states = expand_with_blanks(targets, blank);
    let s_len = states.len();

    let mut prev = vec![f32::NEG_INFINITY; s_len];
    let mut curr = vec![f32::NEG_INFINITY; s_len];
    let mut bp = vec![0u8; t_len * s_len];

    prev[0] = log_probs[0][states[0]];
    if s_len > 1 {
        prev[1] = log_probs[0][states[1]];
    }

    let mut prev_start = 0usize;
    let mut prev_end = if s_len > 1 { 1 } else { 0 };
    let final_floor_state = s_len.saturating_sub(2);

    for t in 1..t_len {
        let row = &log_probs[t];
        let remaining = t_len - 1 - t;
        let curr_start = final_floor_state.saturating_sub(2 * remaining);
        let curr_end = (2 * t + 1).min(s_len - 1);

        curr.fill(f32::NEG_INFINITY);
        let bp_offset = t * s_len;
        for s in curr_start..=curr_end {
            let (best, step) = best_transition(&prev, s, prev_start, prev_end, &states);
            curr[s] = best + row[states[s]];
            bp[bp_offset + s] = step;
        }

        std::mem::swap(&mut prev, &mut curr);
        prev_start = curr_start;
        prev_end = curr_end;
    }

    let mut s = s_len - 1;
    if s_len >= 2 && prev[s_len - 2] > prev[s_len - 1] {
        s = s_len - 2;
    }
    let score = prev[s];

    let mut labels = vec![0usize; t_len];
    labels[t_len - 1] = states[s];
    for t in (1..t_len).rev() {
        s = match bp[t * s_len + s] {
            1 => s - 1,
            2 => s - 2,
            _ => s,
        };
        labels[t - 1] = states[s];
    }

    Ok(DecisionPath { labels, score })
}

#[inline(always)]
fn best_transition(
    prev: &[f32],
    s: usize,
    prev_start: usize,
    prev_end: usize,
    states: &[usize],
) -> (f32, u8) {
    let live = |p: usize| p >= prev_start && p <= prev_end;
    let mut best = f32::NEG_INFINITY;
    let mut step = 0u8;

    if live(s) {
        best = prev[s];
    }
    if s >= 1 && live(s - 1) && prev[s - 1] > best {
        best = prev[s - 1];
        step = 1;
    }
    if s >= 2 && states[s] != states[s - 2] && live(s - 2) && prev[s - 2] > best {
        best = prev[s - 2];
        step = 2;
    }
    (best, step)
}

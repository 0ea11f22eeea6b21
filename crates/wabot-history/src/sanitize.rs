//! Conversation sanitization before a chat-completion request.
//!
//! Chat APIs reject histories where a tool call has no response, a tool
//! response has no call, or the request is unbounded. Three passes run in
//! order over the accumulated turns:
//!
//! 1. Drop a `user` turn that repeats the previous retained `user` turn.
//! 2. Keep an assistant tool-call turn only if every declared id has exactly
//!    one later tool response; keep a tool response only if a surviving
//!    assistant turn claimed it.
//! 3. Keep the last [`MAX_HISTORY_TURNS`] turns, plus a leading `system` turn.
//!
//! Truncation does not re-check tool-call pairs at the window boundary.

use std::collections::{HashMap, HashSet};
use wabot_core::turn::{Role, Turn};

/// Maximum turns kept after truncation, not counting a leading system turn.
pub const MAX_HISTORY_TURNS: usize = 50;

/// What each pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    pub input_len: usize,
    /// Repeated consecutive user turns.
    pub duplicates: usize,
    /// Assistant tool-call turns with a missing or ambiguous response.
    pub assistant_dropped: usize,
    /// Tool responses not claimed by a surviving assistant turn.
    pub tool_dropped: usize,
    /// Turns cut by the history limit.
    pub truncated: usize,
    pub output_len: usize,
}

impl SanitizeReport {
    /// Whether any turn was removed.
    pub fn changed(&self) -> bool {
        self.input_len != self.output_len
    }
}

/// Sanitize `turns` into a new, protocol-valid sequence.
///
/// Never fails: malformed tool-call structures are dropped.
pub fn sanitize(turns: &[Turn]) -> Vec<Turn> {
    sanitize_with_report(turns).0
}

/// Like [`sanitize`], also returning per-pass drop counts.
pub fn sanitize_with_report(turns: &[Turn]) -> (Vec<Turn>, SanitizeReport) {
    let mut report = SanitizeReport {
        input_len: turns.len(),
        ..Default::default()
    };

    let deduped = dedup_user_turns(turns.iter());
    report.duplicates = turns.len() - deduped.len();

    let reconciled = reconcile_tool_calls(&deduped, &mut report);

    // Dropping a tool-call turn can leave two equal user turns side by side.
    let before = reconciled.len();
    let reconciled = dedup_user_turns(reconciled);
    report.duplicates += before - reconciled.len();

    let before = reconciled.len();
    let kept = truncate(reconciled, MAX_HISTORY_TURNS);
    report.truncated = before - kept.len();
    report.output_len = kept.len();

    (kept.into_iter().cloned().collect(), report)
}

fn is_repeated_user(prev: &Turn, turn: &Turn) -> bool {
    turn.role == Role::User && prev.role == Role::User && prev.content == turn.content
}

fn dedup_user_turns<'a>(turns: impl IntoIterator<Item = &'a Turn>) -> Vec<&'a Turn> {
    let mut out: Vec<&Turn> = Vec::new();
    for turn in turns {
        if out.last().is_some_and(|prev| is_repeated_user(prev, turn)) {
            continue;
        }
        out.push(turn);
    }
    out
}

/// Positions of the tool responses answering each declared id of the
/// assistant turn at `pos`, or `None` if the turn cannot be satisfied.
///
/// Each id needs exactly one response after `pos`; an id declared twice in
/// the same turn makes the turn unsatisfiable.
fn claim_responses(
    pos: usize,
    turn: &Turn,
    responses: &HashMap<&str, Vec<usize>>,
) -> Option<Vec<usize>> {
    let mut seen = HashSet::new();
    let mut claimed = Vec::with_capacity(turn.tool_calls.len());
    for id in turn.declared_call_ids() {
        if !seen.insert(id) {
            return None;
        }
        let mut later = responses.get(id)?.iter().copied().filter(|&j| j > pos);
        match (later.next(), later.next()) {
            (Some(j), None) => claimed.push(j),
            _ => return None,
        }
    }
    Some(claimed)
}

fn reconcile_tool_calls<'a>(turns: &[&'a Turn], report: &mut SanitizeReport) -> Vec<&'a Turn> {
    let mut responses: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, turn) in turns.iter().enumerate() {
        if turn.role == Role::Tool {
            if let Some(id) = turn.tool_call_id.as_deref() {
                responses.entry(id).or_default().push(i);
            }
        }
    }

    // Verdicts first, then a single filter pass.
    let mut keep_call = vec![false; turns.len()];
    let mut claimed = vec![false; turns.len()];
    for (i, turn) in turns.iter().enumerate() {
        if !turn.has_tool_calls() {
            continue;
        }
        if let Some(positions) = claim_responses(i, turn, &responses) {
            keep_call[i] = true;
            for j in positions {
                claimed[j] = true;
            }
        }
    }

    let mut out = Vec::with_capacity(turns.len());
    for (i, turn) in turns.iter().enumerate() {
        if turn.has_tool_calls() {
            if keep_call[i] {
                out.push(*turn);
            } else {
                report.assistant_dropped += 1;
            }
        } else if turn.role == Role::Tool {
            if claimed[i] {
                out.push(*turn);
            } else {
                report.tool_dropped += 1;
            }
        } else {
            out.push(*turn);
        }
    }
    out
}

fn truncate(turns: Vec<&Turn>, max: usize) -> Vec<&Turn> {
    if turns.len() <= max {
        return turns;
    }
    let tail = &turns[turns.len() - max..];
    match turns.first() {
        Some(first) if first.role == Role::System => {
            let mut out = Vec::with_capacity(max + 1);
            out.push(*first);
            out.extend_from_slice(tail);
            out
        }
        _ => tail.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wabot_core::turn::ToolCall;

    fn call(ids: &[&str]) -> Turn {
        Turn::tool_calls(ids.iter().map(|id| ToolCall::new(*id)).collect())
    }

    fn numbered_users(n: usize) -> Vec<Turn> {
        (0..n).map(|i| Turn::user(format!("Message {i}"))).collect()
    }

    /// Adjacency and tool-pairing invariants every untruncated output holds.
    fn assert_invariants(out: &[Turn]) {
        for pair in out.windows(2) {
            assert!(
                !is_repeated_user(&pair[0], &pair[1]),
                "adjacent duplicate user turns: {pair:?}"
            );
        }
        for (i, turn) in out.iter().enumerate() {
            if turn.has_tool_calls() {
                for id in turn.declared_call_ids() {
                    let matches = out[i + 1..]
                        .iter()
                        .filter(|t| t.role == Role::Tool && t.tool_call_id.as_deref() == Some(id))
                        .count();
                    assert_eq!(matches, 1, "call {id} must have exactly one response");
                }
            }
            if turn.role == Role::Tool {
                let id = turn.tool_call_id.as_deref().expect("tool turn without id");
                assert!(
                    out[..i]
                        .iter()
                        .any(|t| t.has_tool_calls() && t.declared_call_ids().any(|d| d == id)),
                    "tool response {id} has no preceding call"
                );
            }
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(sanitize(&[]).is_empty());
        let (_, report) = sanitize_with_report(&[]);
        assert!(!report.changed());
    }

    #[test]
    fn test_consecutive_duplicate_users_collapse() {
        let turns = vec![
            Turn::user("Hello"),
            Turn::user("Hello"),
            Turn::assistant("Hi there!"),
            Turn::user("How are you?"),
            Turn::user("How are you?"),
            Turn::user("How are you?"),
        ];
        let (out, report) = sanitize_with_report(&turns);
        assert_eq!(
            out,
            vec![
                Turn::user("Hello"),
                Turn::assistant("Hi there!"),
                Turn::user("How are you?"),
            ]
        );
        assert_eq!(report.duplicates, 3);
    }

    #[test]
    fn test_non_adjacent_duplicates_kept() {
        let turns = vec![
            Turn::user("Hello"),
            Turn::assistant("Hi!"),
            Turn::user("Hello"),
        ];
        assert_eq!(sanitize(&turns), turns);
    }

    #[test]
    fn test_repeated_assistant_turns_kept() {
        let turns = vec![Turn::assistant("ok"), Turn::assistant("ok")];
        assert_eq!(sanitize(&turns), turns);
    }

    #[test]
    fn test_mismatched_call_and_response_both_dropped() {
        let turns = vec![call(&["tool1"]), Turn::tool_response("tool2", "response")];
        let (out, report) = sanitize_with_report(&turns);
        assert!(out.is_empty());
        assert_eq!(report.assistant_dropped, 1);
        assert_eq!(report.tool_dropped, 1);
    }

    #[test]
    fn test_valid_tool_sequence_kept() {
        let turns = vec![call(&["tool1"]), Turn::tool_response("tool1", "response")];
        assert_eq!(sanitize(&turns), turns);
    }

    #[test]
    fn test_partial_multi_call_dropped_with_its_responses() {
        let turns = vec![call(&["tool1", "tool2"]), Turn::tool_response("tool1", "r1")];
        assert!(sanitize(&turns).is_empty());
    }

    #[test]
    fn test_complex_tool_scenario() {
        let turns = vec![
            Turn::user("..."),
            call(&["A"]),
            Turn::tool_response("A", "..."),
            call(&["B", "C"]),
            Turn::tool_response("B", "..."),
            Turn::tool_response("D", "..."),
        ];
        let (out, report) = sanitize_with_report(&turns);
        assert_eq!(
            out,
            vec![
                Turn::user("..."),
                call(&["A"]),
                Turn::tool_response("A", "..."),
            ]
        );
        assert_eq!(report.assistant_dropped, 1);
        assert_eq!(report.tool_dropped, 2);
        assert_invariants(&out);
    }

    #[test]
    fn test_response_before_call_does_not_satisfy_it() {
        let turns = vec![Turn::tool_response("A", "early"), call(&["A"])];
        assert!(sanitize(&turns).is_empty());
    }

    #[test]
    fn test_duplicate_responses_drop_the_group() {
        let turns = vec![
            call(&["A"]),
            Turn::tool_response("A", "first"),
            Turn::tool_response("A", "retry"),
        ];
        assert!(sanitize(&turns).is_empty());
    }

    #[test]
    fn test_id_declared_twice_in_one_turn_dropped() {
        let turns = vec![
            call(&["A", "A"]),
            Turn::tool_response("A", "r"),
            Turn::tool_response("A", "r"),
        ];
        assert!(sanitize(&turns).is_empty());
    }

    #[test]
    fn test_reused_id_validated_per_turn() {
        // The second call reuses "A" but nothing answers it.
        let turns = vec![
            call(&["A"]),
            Turn::tool_response("A", "r"),
            Turn::user("again"),
            call(&["A"]),
        ];
        let out = sanitize(&turns);
        assert_eq!(out, turns[..3].to_vec());
        assert_invariants(&out);
    }

    #[test]
    fn test_interleaved_responses_for_multi_call() {
        let turns = vec![
            call(&["A", "B"]),
            Turn::tool_response("B", "b"),
            Turn::tool_response("A", "a"),
            Turn::assistant("done"),
        ];
        assert_eq!(sanitize(&turns), turns);
    }

    #[test]
    fn test_tool_turn_without_id_dropped() {
        let mut orphan = Turn::tool_response("x", "r");
        orphan.tool_call_id = None;
        let turns = vec![Turn::user("hi"), orphan];
        assert_eq!(sanitize(&turns), vec![Turn::user("hi")]);
    }

    #[test]
    fn test_empty_tool_calls_trivially_valid() {
        let turns = vec![Turn::tool_calls(Vec::new()), Turn::user("hi")];
        assert_eq!(sanitize(&turns), turns);
    }

    #[test]
    fn test_user_without_content_deduped() {
        let mut blank = Turn::user("");
        blank.content = None;
        let turns = vec![blank.clone(), blank.clone()];
        assert_eq!(sanitize(&turns), vec![blank]);
    }

    #[test]
    fn test_duplicates_exposed_by_reconciliation_collapse() {
        let turns = vec![Turn::user("ping"), call(&["lost"]), Turn::user("ping")];
        let (out, report) = sanitize_with_report(&turns);
        assert_eq!(out, vec![Turn::user("ping")]);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.assistant_dropped, 1);
    }

    #[test]
    fn test_truncate_without_system() {
        let out = sanitize(&numbered_users(60));
        assert_eq!(out.len(), 50);
        assert_eq!(out[0].content_str(), "Message 10");
        assert_eq!(out[49].content_str(), "Message 59");
    }

    #[test]
    fn test_truncate_keeps_leading_system() {
        let mut turns = vec![Turn::system("You are a helpful assistant.")];
        turns.extend(numbered_users(60));
        let (out, report) = sanitize_with_report(&turns);
        assert_eq!(out.len(), 51);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].content_str(), "Message 10");
        assert_eq!(report.truncated, 10);
    }

    #[test]
    fn test_exactly_max_plus_system_not_truncated() {
        let mut turns = vec![Turn::system("sys")];
        turns.extend(numbered_users(50));
        assert_eq!(sanitize(&turns), turns);
    }

    #[test]
    fn test_non_leading_system_not_pinned() {
        let mut turns = numbered_users(30);
        turns.push(Turn::system("late"));
        turns.extend((30..60).map(|i| Turn::user(format!("Message {i}"))));
        let out = sanitize(&turns);
        assert_eq!(out.len(), 50);
        assert_eq!(out[0].content_str(), "Message 11");
    }

    #[test]
    fn test_all_passes_together() {
        let mut turns = vec![Turn::system("System message")];
        turns.extend(numbered_users(60));
        turns.push(Turn::user("Duplicate"));
        turns.push(Turn::user("Duplicate"));
        turns.push(call(&["tool1"]));
        turns.push(Turn::tool_response("tool1", "response"));
        turns.push(call(&["tool2"]));

        let (out, report) = sanitize_with_report(&turns);
        assert_eq!(out.len(), 51);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].content_str(), "Message 13");
        assert_eq!(
            out.iter().filter(|t| t.content_str() == "Duplicate").count(),
            1
        );
        assert!(!out
            .iter()
            .any(|t| t.declared_call_ids().any(|id| id == "tool2")));
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.assistant_dropped, 1);
        assert_eq!(report.truncated, 13);
        assert_invariants(&out);
    }

    #[test]
    fn test_truncation_can_orphan_a_response() {
        // Window boundary falls between a call and its response; kept as-is.
        let mut turns = numbered_users(10);
        turns.push(call(&["A"]));
        turns.push(Turn::tool_response("A", "r"));
        turns.extend((10..59).map(|i| Turn::user(format!("Message {i}"))));
        let out = sanitize(&turns);
        assert_eq!(out.len(), 50);
        assert_eq!(out[0].role, Role::Tool);
    }

    #[test]
    fn test_wire_json_round_trip() {
        let json = r#"[
            {"role": "user", "content": "what's on my calendar?"},
            {"role": "assistant", "content": null,
             "tool_calls": [{"id": "call_cal", "type": "function",
                             "function": {"name": "list_events", "arguments": "{}"}}]},
            {"role": "tool", "tool_call_id": "call_cal", "content": "[]"},
            {"role": "tool", "tool_call_id": "call_old", "content": "stale"},
            {"role": "assistant", "content": "Nothing scheduled."}
        ]"#;
        let turns: Vec<Turn> = serde_json::from_str(json).unwrap();
        let out = serde_json::to_value(sanitize(&turns)).unwrap();
        let out = out.as_array().unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[1]["tool_calls"][0]["function"]["name"], "list_events");
        assert_eq!(out[2]["tool_call_id"], "call_cal");
        assert_eq!(out[3]["content"], "Nothing scheduled.");
    }

    #[test]
    fn test_input_not_mutated() {
        let turns = vec![call(&["x"]), Turn::user("a"), Turn::user("a")];
        let snapshot = turns.clone();
        let _ = sanitize(&turns);
        assert_eq!(turns, snapshot);
    }

    #[test]
    fn test_idempotent_on_mixed_inputs() {
        let inputs = vec![
            vec![
                Turn::system("s"),
                Turn::user("a"),
                Turn::user("a"),
                call(&["1", "2"]),
                Turn::tool_response("2", "two"),
                Turn::tool_response("1", "one"),
                Turn::assistant("answer"),
                Turn::tool_response("9", "stray"),
            ],
            vec![
                Turn::user("q"),
                call(&["x"]),
                Turn::user("q"),
                Turn::tool_response("x", "late"),
                call(&["y"]),
            ],
            numbered_users(75),
        ];
        for input in inputs {
            let once = sanitize(&input);
            assert_invariants(&once);
            assert!(once.len() <= MAX_HISTORY_TURNS + 1);
            assert_eq!(sanitize(&once), once);
        }
    }

    #[test]
    fn test_invariants_hold_on_adversarial_shapes() {
        let mut no_id = Turn::tool_response("A", "lost");
        no_id.tool_call_id = None;

        // (input, expected output)
        let cases = vec![
            // Two calls share one later response; each sees exactly one.
            (
                vec![call(&["X"]), call(&["X"]), Turn::tool_response("X", "r")],
                vec![call(&["X"]), call(&["X"]), Turn::tool_response("X", "r")],
            ),
            // A response before its call is dropped; the later one answers it.
            (
                vec![
                    Turn::tool_response("X", "early"),
                    call(&["X"]),
                    Turn::tool_response("X", "late"),
                ],
                vec![call(&["X"]), Turn::tool_response("X", "late")],
            ),
            // Reused id: the first call sees two later responses and loses.
            (
                vec![
                    call(&["A"]),
                    Turn::tool_response("A", "first"),
                    call(&["A"]),
                    Turn::tool_response("A", "second"),
                ],
                vec![call(&["A"]), Turn::tool_response("A", "second")],
            ),
            // Nested groups answered out of order.
            (
                vec![
                    call(&["A", "B"]),
                    call(&["C"]),
                    Turn::tool_response("C", "c"),
                    Turn::tool_response("A", "a"),
                    Turn::tool_response("B", "b"),
                ],
                vec![
                    call(&["A", "B"]),
                    call(&["C"]),
                    Turn::tool_response("C", "c"),
                    Turn::tool_response("A", "a"),
                    Turn::tool_response("B", "b"),
                ],
            ),
            // Dropping a partial group exposes a duplicate user turn.
            (
                vec![
                    Turn::user("q"),
                    call(&["A", "B"]),
                    Turn::tool_response("A", "a"),
                    Turn::user("q"),
                ],
                vec![Turn::user("q")],
            ),
            // A tool turn without an id inside a valid group.
            (
                vec![
                    Turn::user("hi"),
                    call(&["A"]),
                    no_id,
                    Turn::tool_response("A", "a"),
                    Turn::assistant("ok"),
                ],
                vec![
                    Turn::user("hi"),
                    call(&["A"]),
                    Turn::tool_response("A", "a"),
                    Turn::assistant("ok"),
                ],
            ),
            // Duplicate responses poison every call that can see both.
            (
                vec![
                    call(&["A"]),
                    Turn::tool_response("A", "r1"),
                    call(&["A"]),
                    Turn::tool_response("A", "r2"),
                    Turn::tool_response("A", "r3"),
                ],
                vec![],
            ),
        ];

        for (input, expected) in cases {
            let once = sanitize(&input);
            assert_eq!(once, expected, "input: {input:?}");
            assert_invariants(&once);
            assert!(once.len() <= MAX_HISTORY_TURNS + 1);
            assert_eq!(sanitize(&once), once, "not idempotent: {input:?}");
        }
    }
}

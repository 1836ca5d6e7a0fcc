// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The `View`: the ordered sequence of LLM-convertible events after
//! applying condensation.
//!
//! All condensations' forgotten sets apply cumulatively (so an event
//! forgotten once never resurfaces); the *last* condensation contributes
//! the summary text and its insertion offset. The system prompt is never
//! part of any forgotten set and always leads the view.

use std::collections::HashSet;

use tiller_llm::{ContentPart, Role};

use crate::event::{Event, EventId, EventKind, EventSource};

#[derive(Debug, Clone)]
pub struct View {
    pub events: Vec<Event>,
    /// Summary event ids of every condensation seen, in order. These are
    /// pinned: no later condensation may forget them.
    pub pinned_summary_ids: Vec<EventId>,
    /// Summary text of the most recent condensation, if any.
    pub last_summary: Option<String>,
}

impl View {
    pub fn from_events(events: &[Event]) -> Self {
        let mut forgotten: HashSet<&str> = HashSet::new();
        let mut pinned_summary_ids = Vec::new();
        let mut last_condensation: Option<(&str, &str, usize)> = None; // (summary, summary_event_id, offset)

        for event in events {
            if let EventKind::Condensation {
                summary,
                summary_offset,
                forgotten_event_ids,
                summary_event_id,
            } = &event.kind
            {
                for id in forgotten_event_ids {
                    forgotten.insert(id.as_str());
                }
                pinned_summary_ids.push(summary_event_id.clone());
                last_condensation = Some((summary, summary_event_id, *summary_offset));
            }
        }

        let mut system: Option<Event> = None;
        let mut rest: Vec<Event> = Vec::new();
        for event in events {
            if !event.is_llm_convertible() {
                continue;
            }
            if matches!(event.kind, EventKind::SystemPrompt { .. }) {
                system = Some(event.clone());
                continue;
            }
            if forgotten.contains(event.id.as_str()) {
                continue;
            }
            rest.push(event.clone());
        }

        let mut out = Vec::with_capacity(rest.len() + 2);
        if let Some(system) = system {
            out.push(system);
        }
        match last_condensation {
            Some((summary, summary_event_id, offset)) => {
                let insert_at = offset.min(rest.len());
                let mut iter = rest.into_iter();
                for _ in 0..insert_at {
                    out.push(iter.next().expect("insert_at bounded by len"));
                }
                out.push(synthesize_summary_event(summary, summary_event_id));
                out.extend(iter);
                Self {
                    events: out,
                    pinned_summary_ids,
                    last_summary: Some(summary.to_string()),
                }
            }
            None => {
                out.extend(rest);
                Self {
                    events: out,
                    pinned_summary_ids,
                    last_summary: None,
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Tool-call ids of `Action` events with no later terminator
    /// (`Observation` / `UserReject` / tool-scoped `AgentError`).
    pub fn unmatched_tool_calls(events: &[Event]) -> Vec<String> {
        let terminated: HashSet<&str> = events
            .iter()
            .filter_map(|e| e.terminates_tool_call())
            .collect();
        events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Action { tool_call_id, .. }
                    if !terminated.contains(tool_call_id.as_str()) =>
                {
                    Some(tool_call_id.clone())
                }
                _ => None,
            })
            .collect()
    }
}

fn synthesize_summary_event(summary: &str, summary_event_id: &str) -> Event {
    let mut event = Event::new(
        EventSource::Environment,
        EventKind::Message {
            role: Role::User,
            content: vec![ContentPart::text(format!(
                "Earlier conversation history was condensed. Summary:\n{summary}"
            ))],
        },
    );
    event.id = summary_event_id.to_string();
    event
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_llm::ToolSchema;

    fn system() -> Event {
        Event::new(
            EventSource::Agent,
            EventKind::SystemPrompt {
                prompt: "prompt".into(),
                tools: Vec::<ToolSchema>::new(),
                dynamic_context: None,
            },
        )
    }

    fn seed(n: usize) -> Vec<Event> {
        let mut events = vec![system()];
        for i in 0..n {
            events.push(Event::user_message(format!("m{i}")));
        }
        for (i, e) in events.iter_mut().enumerate() {
            e.order = i as u64;
        }
        events
    }

    #[test]
    fn view_without_condensation_is_convertible_events() {
        let mut events = seed(3);
        events.push(Event::new(
            EventSource::Environment,
            EventKind::StateUpdate {
                key: "k".into(),
                value: serde_json::json!(1),
            },
        ));
        let view = View::from_events(&events);
        assert_eq!(view.len(), 4, "state update is not in the view");
        assert!(view.last_summary.is_none());
    }

    #[test]
    fn condensation_replaces_forgotten_range_with_summary() {
        let mut events = seed(4);
        let forgotten = vec![events[1].id.clone(), events[2].id.clone()];
        events.push(Event::new(
            EventSource::Environment,
            EventKind::Condensation {
                summary: "early chatter".into(),
                summary_offset: 0,
                forgotten_event_ids: forgotten,
                summary_event_id: "summary-1".into(),
            },
        ));
        let view = View::from_events(&events);
        // system + summary + 2 surviving messages
        assert_eq!(view.len(), 4);
        assert!(matches!(view.events[0].kind, EventKind::SystemPrompt { .. }));
        assert_eq!(view.events[1].id, "summary-1");
        match &view.events[1].kind {
            EventKind::Message { content, .. } => {
                assert!(content[0].as_text().unwrap().contains("early chatter"));
            }
            _ => panic!("summary must be a message"),
        }
    }

    #[test]
    fn summary_offset_positions_summary_after_kept_head() {
        let mut events = seed(5);
        let forgotten = vec![events[3].id.clone(), events[4].id.clone()];
        events.push(Event::new(
            EventSource::Environment,
            EventKind::Condensation {
                summary: "middle".into(),
                summary_offset: 2,
                forgotten_event_ids: forgotten,
                summary_event_id: "summary-2".into(),
            },
        ));
        let view = View::from_events(&events);
        // system, m0, m1, summary, m4(remaining)
        assert_eq!(view.events[3].id, "summary-2");
    }

    #[test]
    fn forgotten_sets_accumulate_across_condensations() {
        let mut events = seed(4);
        events.push(Event::new(
            EventSource::Environment,
            EventKind::Condensation {
                summary: "first".into(),
                summary_offset: 0,
                forgotten_event_ids: vec![events[1].id.clone()],
                summary_event_id: "s1".into(),
            },
        ));
        events.push(Event::new(
            EventSource::Environment,
            EventKind::Condensation {
                summary: "second".into(),
                summary_offset: 0,
                forgotten_event_ids: vec![events[2].id.clone()],
                summary_event_id: "s2".into(),
            },
        ));
        let view = View::from_events(&events);
        let ids: Vec<&str> = view.events.iter().map(|e| e.id.as_str()).collect();
        // m1 (forgotten by the first condensation) must not resurface.
        assert!(!ids.contains(&events[1].id.as_str()));
        assert!(!ids.contains(&events[2].id.as_str()));
        assert!(ids.contains(&"s2"));
        assert!(!ids.contains(&"s1"), "only the last summary is live");
        assert_eq!(view.pinned_summary_ids, vec!["s1", "s2"]);
    }

    #[test]
    fn unmatched_tool_calls_ignores_terminated_actions() {
        let mut events = seed(1);
        events.push(Event::new(
            EventSource::Agent,
            EventKind::Action {
                tool_name: "terminal".into(),
                tool_call_id: "c1".into(),
                llm_response_id: "r1".into(),
                arguments: serde_json::json!({}),
                thought: None,
                risk: None,
                critic: None,
            },
        ));
        assert_eq!(View::unmatched_tool_calls(&events), vec!["c1"]);

        events.push(Event::new(
            EventSource::Environment,
            EventKind::UserReject {
                tool_call_id: "c1".into(),
                reason: "no".into(),
            },
        ));
        assert!(View::unmatched_tool_calls(&events).is_empty());
    }
}

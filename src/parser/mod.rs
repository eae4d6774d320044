//! Tag stream parser
//!
//! Pull-based state machine over model output: `feed(chunk)` returns every
//! element event the chunk made decidable. Elements form an explicit stack;
//! same-tag nesting is tracked with a per-element depth counter and closing an
//! ancestor finalizes everything opened inside it.

pub mod tokenizer;

use crate::config::TagConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokenizer::{Token, Tokenizer};
use tracing::{debug, trace};

/// A tag occurrence while it is being parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackElement {
    pub index: u64,
    pub tag: String,
    pub attributes: BTreeMap<String, String>,
    pub content: String,
    pub done: bool,
    #[serde(skip)]
    depth: u32,
}

impl StackElement {
    fn open(index: u64, tag: String, attributes: BTreeMap<String, String>) -> Self {
        Self {
            index,
            tag,
            attributes,
            content: String::new(),
            done: false,
            depth: 0,
        }
    }

    fn finalized(mut self) -> Self {
        self.done = true;
        self
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementEventKind {
    Start,
    Text,
    End,
}

/// Snapshot of an element after a parser transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementEvent {
    pub kind: ElementEventKind,
    pub element: StackElement,
}

impl ElementEvent {
    fn new(kind: ElementEventKind, element: StackElement) -> Self {
        Self { kind, element }
    }
}

pub struct TagStreamParser {
    tags: HashMap<String, TagConfig>,
    tokenizer: Tokenizer,
    current: Option<StackElement>,
    stack: Vec<StackElement>,
    next_index: u64,
}

impl TagStreamParser {
    pub fn new(tags: &[TagConfig], initial_index: u64) -> Self {
        Self {
            tags: tags.iter().map(|t| (t.name.clone(), t.clone())).collect(),
            tokenizer: Tokenizer::new(tags.iter().map(|t| t.name.clone())),
            current: None,
            stack: Vec::new(),
            next_index: initial_index,
        }
    }

    /// Index the next started element will receive
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<ElementEvent> {
        self.tokenizer.push(chunk);

        let mut events = Vec::new();
        while let Some(token) = self.tokenizer.next_token() {
            self.apply(token, &mut events);
        }
        events
    }

    /// End of stream: flush buffered text and finalize elements left open
    pub fn finish(&mut self) -> Vec<ElementEvent> {
        let mut events = Vec::new();
        if let Some(token) = self.tokenizer.finish() {
            self.apply(token, &mut events);
        }

        if let Some(current) = self.current.take() {
            debug!(tag = %current.tag, index = current.index, "Finalizing unclosed element");
            events.push(ElementEvent::new(ElementEventKind::End, current.finalized()));
        }
        while let Some(el) = self.stack.pop() {
            events.push(ElementEvent::new(ElementEventKind::End, el.finalized()));
        }
        events
    }

    fn is_container(&self, tag: &str) -> bool {
        self.tags.get(tag).map(|t| t.container).unwrap_or(false)
    }

    fn is_reentrant(&self, tag: &str) -> bool {
        self.tags.get(tag).map(|t| t.reentrant).unwrap_or(false)
    }

    fn apply(&mut self, token: Token, events: &mut Vec<ElementEvent>) {
        match token {
            Token::Text(text) => self.push_text(&text, events),
            Token::Open {
                name,
                attributes,
                self_closing,
                raw,
            } => self.open(name, attributes, self_closing, raw, events),
            Token::Close { name, raw } => self.close(name, raw, events),
        }
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<ElementEvent>) {
        match self.current.as_mut() {
            Some(current) => {
                current.content.push_str(text);
                events.push(ElementEvent::new(ElementEventKind::Text, current.clone()));
            }
            None => trace!(len = text.len(), "Dropping text outside any element"),
        }
    }

    fn open(
        &mut self,
        name: String,
        attributes: BTreeMap<String, String>,
        self_closing: bool,
        raw: String,
        events: &mut Vec<ElementEvent>,
    ) {
        let same_tag = self.current.as_ref().map(|c| c.tag == name).unwrap_or(false);

        if same_tag {
            if self.is_reentrant(&name) && !self_closing {
                if let Some(current) = self.current.as_mut() {
                    current.depth += 1;
                }
            }
            self.push_text(&raw, events);
            return;
        }

        let accepts_child = match &self.current {
            None => true,
            Some(current) => self.is_container(&current.tag),
        };

        if !accepts_child {
            self.push_text(&raw, events);
            return;
        }

        if let Some(parent) = self.current.take() {
            self.stack.push(parent);
        }

        let element = StackElement::open(self.next_index, name, attributes);
        self.next_index += 1;
        events.push(ElementEvent::new(ElementEventKind::Start, element.clone()));

        if self_closing {
            events.push(ElementEvent::new(ElementEventKind::End, element.finalized()));
            self.current = self.stack.pop();
        } else {
            self.current = Some(element);
        }
    }

    fn close(&mut self, name: String, raw: String, events: &mut Vec<ElementEvent>) {
        let Some(current_tag) = self.current.as_ref().map(|c| c.tag.clone()) else {
            debug!(tag = %name, "Ignoring close tag with no open element");
            return;
        };

        if current_tag == name {
            let nested = match self.current.as_mut() {
                Some(current) if current.depth > 0 => {
                    current.depth -= 1;
                    true
                }
                _ => false,
            };

            if nested {
                self.push_text(&raw, events);
                return;
            }

            if let Some(done) = self.current.take() {
                events.push(ElementEvent::new(ElementEventKind::End, done.finalized()));
            }
            self.current = self.stack.pop();
            return;
        }

        let Some(ancestor) = self.stack.iter().rposition(|el| el.tag == name) else {
            if self.is_container(&current_tag) {
                debug!(tag = %name, "Ignoring unmatched close tag");
            } else {
                self.push_text(&raw, events);
            }
            return;
        };

        // Model forgot to close inner elements: finalize innermost to outermost
        if let Some(inner) = self.current.take() {
            events.push(ElementEvent::new(ElementEventKind::End, inner.finalized()));
        }
        let mut unclosed = self.stack.split_off(ancestor + 1);
        while let Some(el) = unclosed.pop() {
            events.push(ElementEvent::new(ElementEventKind::End, el.finalized()));
        }
        if let Some(el) = self.stack.pop() {
            events.push(ElementEvent::new(ElementEventKind::End, el.finalized()));
        }
        self.current = self.stack.pop();
    }
}

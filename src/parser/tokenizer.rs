//! Incremental tokenizer for a fixed tag vocabulary
//!
//! Only tags whose name is in the vocabulary are tokenized; everything else,
//! including `<` that cannot start a recognized tag, is text. A token is only
//! produced once enough input has arrived to decide it, so chunk boundaries
//! never change the token sequence (text tokens may be split differently).

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};

/// An open tag that never closes with `>` within this many bytes is text
const MAX_TAG_LEN: usize = 4096;

lazy_static! {
    static ref ATTRIBUTE_PATTERN: Regex = Regex::new(
        r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*(?:=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#
    )
    .expect("attribute pattern is valid");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Open {
        name: String,
        attributes: BTreeMap<String, String>,
        self_closing: bool,
        raw: String,
    },
    Close {
        name: String,
        raw: String,
    },
}

enum Scan {
    Complete(Token, usize),
    Incomplete,
    NotATag,
}

pub struct Tokenizer {
    tags: HashSet<String>,
    buffer: String,
}

impl Tokenizer {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
    }

    /// Next decidable token, or `None` when more input is required
    pub fn next_token(&mut self) -> Option<Token> {
        if self.buffer.is_empty() {
            return None;
        }

        match self.buffer.find('<') {
            None => Some(Token::Text(std::mem::take(&mut self.buffer))),
            Some(pos) if pos > 0 => {
                let text: String = self.buffer.drain(..pos).collect();
                Some(Token::Text(text))
            }
            Some(_) => match self.scan_tag() {
                Scan::Complete(token, len) => {
                    self.buffer.drain(..len);
                    Some(token)
                }
                Scan::Incomplete => None,
                Scan::NotATag => {
                    self.buffer.drain(..1);
                    Some(Token::Text("<".to_string()))
                }
            },
        }
    }

    /// Flush whatever is buffered as text
    pub fn finish(&mut self) -> Option<Token> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(Token::Text(std::mem::take(&mut self.buffer)))
        }
    }

    fn could_become_tag(&self, partial: &str) -> bool {
        self.tags.iter().any(|t| t.starts_with(partial))
    }

    fn scan_tag(&self) -> Scan {
        let buf = self.buffer.as_bytes();
        let mut i = 1;

        let closing = buf.get(1) == Some(&b'/');
        if closing {
            i = 2;
        }

        let name_start = i;
        while i < buf.len() && is_name_byte(buf[i]) {
            i += 1;
        }
        let name = &self.buffer[name_start..i];

        if i == buf.len() {
            return if self.could_become_tag(name) {
                Scan::Incomplete
            } else {
                Scan::NotATag
            };
        }

        if name.is_empty() || !self.tags.contains(name) {
            return Scan::NotATag;
        }

        if closing {
            while i < buf.len() && buf[i].is_ascii_whitespace() {
                i += 1;
            }
            return match buf.get(i) {
                None => Scan::Incomplete,
                Some(b'>') => Scan::Complete(
                    Token::Close {
                        name: name.to_string(),
                        raw: self.buffer[..=i].to_string(),
                    },
                    i + 1,
                ),
                Some(_) => Scan::NotATag,
            };
        }

        let after_name = buf[i];
        if !(after_name.is_ascii_whitespace() || after_name == b'>' || after_name == b'/') {
            return Scan::NotATag;
        }

        let mut quote: Option<u8> = None;
        while i < buf.len() {
            let b = buf[i];
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None if b == b'"' || b == b'\'' => quote = Some(b),
                None if b == b'>' => break,
                None => {}
            }
            i += 1;
            if i > MAX_TAG_LEN {
                return Scan::NotATag;
            }
        }

        if i == buf.len() {
            return Scan::Incomplete;
        }

        let inner = self.buffer[name_start + name.len()..i].trim_end();
        let (inner, self_closing) = match inner.strip_suffix('/') {
            Some(rest) => (rest, true),
            None => (inner, false),
        };

        Scan::Complete(
            Token::Open {
                name: name.to_string(),
                attributes: parse_attributes(inner),
                self_closing,
                raw: self.buffer[..=i].to_string(),
            },
            i + 1,
        )
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b':'
}

fn parse_attributes(raw: &str) -> BTreeMap<String, String> {
    ATTRIBUTE_PATTERN
        .captures_iter(raw)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            (caps[1].to_string(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(tokenizer: &mut Tokenizer) -> Vec<Token> {
        let mut out = Vec::new();
        while let Some(token) = tokenizer.next_token() {
            out.push(token);
        }
        out
    }

    #[test]
    fn test_open_with_attributes() {
        let mut tokenizer = Tokenizer::new(["output"]);
        tokenizer.push(r#"<output type="cli:message" channel='main' urgent>"#);

        let tokens = drain(&mut tokenizer);
        assert_eq!(tokens.len(), 1);
        match &tokens[0] {
            Token::Open {
                name,
                attributes,
                self_closing,
                ..
            } => {
                assert_eq!(name, "output");
                assert_eq!(attributes["type"], "cli:message");
                assert_eq!(attributes["channel"], "main");
                assert_eq!(attributes["urgent"], "");
                assert!(!self_closing);
            }
            other => panic!("unexpected token {:?}", other),
        }
    }

    #[test]
    fn test_waits_for_partial_tag() {
        let mut tokenizer = Tokenizer::new(["thought"]);
        tokenizer.push("hello <thou");
        assert_eq!(drain(&mut tokenizer), vec![Token::Text("hello ".into())]);

        tokenizer.push("ght>");
        assert!(matches!(
            drain(&mut tokenizer).as_slice(),
            [Token::Open { name, .. }] if name == "thought"
        ));
    }

    #[test]
    fn test_unrecognized_tag_is_text() {
        let mut tokenizer = Tokenizer::new(["thought"]);
        tokenizer.push("a <b>bold</b> <thoughtful>");

        let text: String = drain(&mut tokenizer)
            .into_iter()
            .map(|t| match t {
                Token::Text(s) => s,
                other => panic!("unexpected token {:?}", other),
            })
            .collect();
        assert_eq!(text, "a <b>bold</b> <thoughtful>");
    }

    #[test]
    fn test_quoted_gt_inside_attribute() {
        let mut tokenizer = Tokenizer::new(["action_call"]);
        tokenizer.push(r#"<action_call name="a>b">"#);

        match drain(&mut tokenizer).as_slice() {
            [Token::Open { attributes, .. }] => assert_eq!(attributes["name"], "a>b"),
            other => panic!("unexpected tokens {:?}", other),
        }
    }

    #[test]
    fn test_self_closing_and_close() {
        let mut tokenizer = Tokenizer::new(["output"]);
        tokenizer.push("<output type=\"x\"/></output >");

        let tokens = drain(&mut tokenizer);
        assert!(matches!(&tokens[0], Token::Open { self_closing: true, .. }));
        assert!(matches!(&tokens[1], Token::Close { name, .. } if name == "output"));
    }

    #[test]
    fn test_finish_flushes_incomplete_tag() {
        let mut tokenizer = Tokenizer::new(["output"]);
        tokenizer.push("<outp");
        assert!(tokenizer.next_token().is_none());
        assert_eq!(tokenizer.finish(), Some(Token::Text("<outp".into())));
    }
}

//! The structured-field subset (RFC 8941) used by RFC 9421 signature headers
//!
//! `Signature-Input` is a dictionary of inner lists, `Signature` a dictionary
//! of byte sequences. Only the pieces those two headers need are implemented.
//! Parsers are lenient the way the signature verifier needs them to be: any
//! malformed input yields an empty dictionary instead of an error, so a
//! garbage header simply fails verification.

use base64::{engine::general_purpose::STANDARD as Base64, Engine};

/// A bare item: the value part of an item or parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum BareItem {
    /// An integer (15 digits max per RFC 8941)
    Integer(i64),
    /// A quoted string
    String(String),
    /// An unquoted token
    Token(String),
    /// A `:base64:` byte sequence
    ByteSeq(Vec<u8>),
    /// A `?0` / `?1` boolean
    Boolean(bool),
}

/// Parameters attached to an item or inner list, in order.
pub type Params = Vec<(String, BareItem)>;

/// A bare item plus its parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    /// The item value
    pub value: BareItem,
    /// Parameters following the value
    pub params: Params,
}

impl Item {
    /// An item without parameters.
    pub fn plain(value: BareItem) -> Item {
        Item {
            value,
            params: Vec::new(),
        }
    }
}

/// A parenthesized inner list plus its parameters.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct InnerList {
    /// The member items
    pub items: Vec<Item>,
    /// Parameters following the closing parenthesis
    pub params: Params,
}

/// A dictionary member: either a single item or an inner list.
#[derive(Clone, Debug, PartialEq)]
pub enum Member {
    /// `key=item`
    Item(Item),
    /// `key=(...)` inner list
    InnerList(InnerList),
}

/// An ordered dictionary of labeled members.
pub type Dictionary = Vec<(String, Member)>;

/// Parse a structured-field dictionary. Malformed input returns an empty
/// dictionary, never an error.
pub fn parse_dictionary(input: &str) -> Dictionary {
    let mut parser = Parser::new(input);
    match parser.dictionary() {
        Some(dict) => dict,
        None => Vec::new(),
    }
}

/// Serialize a dictionary. `parse_dictionary(format_dictionary(d)) == d`.
pub fn format_dictionary(dict: &Dictionary) -> String {
    let mut out = String::new();
    for (i, (key, member)) in dict.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(key);
        out.push('=');
        match member {
            Member::Item(item) => format_item(item, &mut out),
            Member::InnerList(list) => format_inner_list(list, &mut out),
        }
    }
    out
}

/// Serialize a lone inner list, as used in the `@signature-params` line of a
/// signature base.
pub fn format_inner_list_standalone(list: &InnerList) -> String {
    let mut out = String::new();
    format_inner_list(list, &mut out);
    out
}

/// Serialize a lone item, as used for the component names of a signature
/// base (`"@query-param";name="id"`).
pub fn format_item_standalone(item: &Item) -> String {
    let mut out = String::new();
    format_item(item, &mut out);
    out
}

fn format_inner_list(list: &InnerList, out: &mut String) {
    out.push('(');
    for (i, item) in list.items.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        format_item(item, out);
    }
    out.push(')');
    format_params(&list.params, out);
}

fn format_item(item: &Item, out: &mut String) {
    format_bare(&item.value, out);
    format_params(&item.params, out);
}

fn format_params(params: &Params, out: &mut String) {
    for (key, value) in params {
        out.push(';');
        out.push_str(key);
        if *value != BareItem::Boolean(true) {
            out.push('=');
            format_bare(value, out);
        }
    }
}

fn format_bare(value: &BareItem, out: &mut String) {
    match value {
        BareItem::Integer(n) => out.push_str(&n.to_string()),
        BareItem::String(s) => {
            out.push('"');
            for c in s.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
        BareItem::Token(t) => out.push_str(t),
        BareItem::ByteSeq(bytes) => {
            out.push(':');
            out.push_str(&Base64.encode(bytes));
            out.push(':');
        }
        BareItem::Boolean(b) => out.push_str(if *b { "?1" } else { "?0" }),
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Some(byte)
    }

    fn skip_sp(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ') | Some(b'\t')) {
            self.pos += 1;
        }
    }

    fn dictionary(&mut self) -> Option<Dictionary> {
        let mut dict: Dictionary = Vec::new();
        self.skip_sp();
        if self.peek().is_none() {
            return Some(dict);
        }
        loop {
            let key = self.key()?;
            let member = if self.peek() == Some(b'=') {
                self.pos += 1;
                if self.peek() == Some(b'(') {
                    Member::InnerList(self.inner_list()?)
                } else {
                    Member::Item(self.item()?)
                }
            } else {
                // A bare key is boolean true, with optional parameters.
                Member::Item(Item {
                    value: BareItem::Boolean(true),
                    params: self.params()?,
                })
            };
            // Last write wins for duplicate keys, per RFC 8941.
            dict.retain(|(k, _)| *k != key);
            dict.push((key, member));

            self.skip_ows();
            match self.peek() {
                None => return Some(dict),
                Some(b',') => {
                    self.pos += 1;
                    self.skip_ows();
                    // trailing comma is malformed
                    self.peek()?;
                }
                _ => return None,
            }
        }
    }

    fn key(&mut self) -> Option<String> {
        let start = self.pos;
        match self.peek()? {
            b'a'..=b'z' | b'*' => self.pos += 1,
            _ => return None,
        }
        while let Some(c) = self.peek() {
            match c {
                b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' | b'.' | b'*' => self.pos += 1,
                _ => break,
            }
        }
        Some(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn inner_list(&mut self) -> Option<InnerList> {
        if self.bump() != Some(b'(') {
            return None;
        }
        let mut items = Vec::new();
        loop {
            self.skip_sp();
            if self.peek() == Some(b')') {
                self.pos += 1;
                break;
            }
            items.push(self.item()?);
        }
        Some(InnerList {
            items,
            params: self.params()?,
        })
    }

    fn item(&mut self) -> Option<Item> {
        let value = self.bare_item()?;
        Some(Item {
            value,
            params: self.params()?,
        })
    }

    fn params(&mut self) -> Option<Params> {
        let mut params = Vec::new();
        while self.peek() == Some(b';') {
            self.pos += 1;
            self.skip_sp();
            let key = self.key()?;
            let value = if self.peek() == Some(b'=') {
                self.pos += 1;
                self.bare_item()?
            } else {
                BareItem::Boolean(true)
            };
            params.retain(|(k, _)| *k != key);
            params.push((key, value));
        }
        Some(params)
    }

    fn bare_item(&mut self) -> Option<BareItem> {
        match self.peek()? {
            b'-' | b'0'..=b'9' => self.integer(),
            b'"' => self.string(),
            b':' => self.byte_seq(),
            b'?' => self.boolean(),
            b'a'..=b'z' | b'A'..=b'Z' | b'*' => self.token(),
            _ => None,
        }
    }

    fn integer(&mut self) -> Option<BareItem> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits_start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        let digits = self.pos - digits_start;
        if digits == 0 || digits > 15 {
            return None;
        }
        // Decimals are not used by signature headers.
        if self.peek() == Some(b'.') {
            return None;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).ok()?;
        text.parse().ok().map(BareItem::Integer)
    }

    fn string(&mut self) -> Option<BareItem> {
        if self.bump() != Some(b'"') {
            return None;
        }
        let mut out = String::new();
        loop {
            match self.bump()? {
                b'"' => return Some(BareItem::String(out)),
                b'\\' => match self.bump()? {
                    c @ (b'"' | b'\\') => out.push(c as char),
                    _ => return None,
                },
                c if (0x20..0x7f).contains(&c) => out.push(c as char),
                _ => return None,
            }
        }
    }

    fn token(&mut self) -> Option<BareItem> {
        let start = self.pos;
        match self.peek()? {
            b'a'..=b'z' | b'A'..=b'Z' | b'*' => self.pos += 1,
            _ => return None,
        }
        while let Some(c) = self.peek() {
            match c {
                b'a'..=b'z'
                | b'A'..=b'Z'
                | b'0'..=b'9'
                | b'!'
                | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
                | b':'
                | b'/' => self.pos += 1,
                _ => break,
            }
        }
        Some(BareItem::Token(
            String::from_utf8_lossy(&self.input[start..self.pos]).into_owned(),
        ))
    }

    fn byte_seq(&mut self) -> Option<BareItem> {
        if self.bump() != Some(b':') {
            return None;
        }
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == b':' {
                let encoded = std::str::from_utf8(&self.input[start..self.pos]).ok()?;
                self.pos += 1;
                return Base64.decode(encoded).ok().map(BareItem::ByteSeq);
            }
            self.pos += 1;
        }
        None
    }

    fn boolean(&mut self) -> Option<BareItem> {
        if self.bump() != Some(b'?') {
            return None;
        }
        match self.bump()? {
            b'1' => Some(BareItem::Boolean(true)),
            b'0' => Some(BareItem::Boolean(false)),
            _ => None,
        }
    }
}

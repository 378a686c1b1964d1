//! Extraction of student-card fields from raw OCR text.
//!
//! OCR output from Thai cards is messy: labels come out misspelt or glued to
//! their values, digits show up in Thai script, and honorifics stick to the
//! first name. The parser works on a token stream, finds label anchors with a
//! fuzzy match, and reads values next to them. Fields without a label fall
//! back to positional guesses at reduced confidence.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use strsim::normalized_levenshtein;

const FUZZY_LABEL_THRESHOLD: f64 = 0.7;
/// Labels shorter than this only match exactly ("ID" vs "IN" is not a label).
const MIN_FUZZY_LABEL_CHARS: usize = 4;
/// How far past an anchor a value may sit.
const VALUE_LOOKAHEAD: usize = 3;
const BUDDHIST_ERA_YEARS: std::ops::RangeInclusive<u32> = 2500..=2600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    StudentId,
    Name,
    Surname,
    FullName,
    Classroom,
    Number,
    NationalId,
}

// Latin entries are compared lowercased with spaces removed.
const LABELS: &[(Label, &str)] = &[
    (Label::NationalId, "เลขประจำตัวประชาชน"),
    (Label::NationalId, "บัตรประชาชน"),
    (Label::NationalId, "identificationnumber"),
    (Label::NationalId, "nationalid"),
    (Label::StudentId, "รหัสนักเรียน"),
    (Label::StudentId, "เลขประจำตัว"),
    (Label::StudentId, "รหัส"),
    (Label::StudentId, "studentid"),
    (Label::StudentId, "id"),
    (Label::FullName, "ชื่อ-นามสกุล"),
    (Label::FullName, "ชื่อ-สกุล"),
    (Label::FullName, "ชื่อสกุล"),
    (Label::Name, "ชื่อ"),
    (Label::Name, "name"),
    (Label::Name, "firstname"),
    (Label::Surname, "นามสกุล"),
    (Label::Surname, "สกุล"),
    (Label::Surname, "surname"),
    (Label::Surname, "lastname"),
    (Label::Classroom, "ห้อง"),
    (Label::Classroom, "ชั้น"),
    (Label::Classroom, "class"),
    (Label::Classroom, "room"),
    (Label::Number, "เลขที่"),
    (Label::Number, "no"),
];

// Longest first so "นางสาว" wins over "นาง".
const HONORIFICS: &[&str] = &[
    "เด็กหญิง", "เด็กชาย", "นางสาว", "นาย", "นาง", "ด.ช.", "ด.ญ.", "น.ส.", "master", "miss", "mrs.",
    "mrs", "mr.", "ms.", "mr", "ms",
];

lazy_static! {
    static ref NATIONAL_ID: Regex =
        Regex::new(r"\b(\d)[ -]?(\d{4})[ -]?(\d{5})[ -]?(\d{2})[ -]?(\d)\b").unwrap();
    static ref CLASSROOM: Regex = Regex::new(r"(ม\.?\s*)?\b(\d{1,2})\s*/\s*(\d{1,2})\b").unwrap();
}

/// Confidence per field, 0 when the field was not found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FieldConfidence {
    pub id: u8,
    pub name: u8,
    pub surname: u8,
    pub classroom: u8,
    pub no: u8,
    pub national_id: u8,
}

impl FieldConfidence {
    fn values(&self) -> [u8; 6] {
        [self.id, self.name, self.surname, self.classroom, self.no, self.national_id]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseResult {
    pub id: Option<String>,
    pub name: Option<String>,
    pub surname: Option<String>,
    pub classroom: Option<String>,
    pub no: Option<u32>,
    pub national_id: Option<String>,
    pub confidence: FieldConfidence,
}

impl ParseResult {
    pub fn found_fields(&self) -> usize {
        self.confidence.values().iter().filter(|c| **c > 0).count()
    }

    /// Mean confidence over the fields that were found.
    pub fn average_confidence(&self) -> u8 {
        let found: Vec<u32> = self.confidence.values().iter().filter(|c| **c > 0).map(|c| *c as u32).collect();
        if found.is_empty() {
            return 0;
        }
        (found.iter().sum::<u32>() as f64 / found.len() as f64).round() as u8
    }

    pub fn is_empty(&self) -> bool {
        self.found_fields() == 0
    }
}

struct Found<T> {
    value: T,
    confidence: u8,
}

impl<T> Found<T> {
    fn new(value: T, confidence: u8) -> Self {
        Self { value, confidence: confidence.clamp(1, 100) }
    }
}

fn unpack<T>(found: Option<Found<T>>) -> (Option<T>, u8) {
    match found {
        Some(f) => (Some(f.value), f.confidence),
        None => (None, 0),
    }
}

#[derive(Debug, Clone)]
struct Token {
    text: String,
    line: usize,
    /// Byte offset inside the rebuilt line.
    offset: usize,
}

struct Document {
    tokens: Vec<Token>,
    /// Each line rebuilt as its tokens joined by single spaces.
    lines: Vec<String>,
}

impl Document {
    fn parse(raw: &str) -> Self {
        let mut tokens = Vec::new();
        let mut lines = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            let normalized: String = line.chars().filter_map(normalize_char).collect();
            let mut rebuilt = String::new();
            let words = normalized
                .split(|c: char| c.is_whitespace() || matches!(c, ':' | ';' | ',' | '|' | '(' | ')' | '[' | ']'))
                .filter(|w| !w.is_empty())
                .flat_map(split_script_runs)
                .flat_map(split_glued_label);
            for word in words {
                if !rebuilt.is_empty() {
                    rebuilt.push(' ');
                }
                tokens.push(Token { text: word.clone(), line: line_no, offset: rebuilt.len() });
                rebuilt.push_str(&word);
            }
            lines.push(rebuilt);
        }
        Self { tokens, lines }
    }

    /// Indices of the tokens of `line` overlapping the byte range.
    fn tokens_in(&self, line: usize, start: usize, end: usize) -> Vec<usize> {
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, t)| t.line == line && t.offset < end && t.offset + t.text.len() > start)
            .map(|(i, _)| i)
            .collect()
    }
}

fn normalize_char(c: char) -> Option<char> {
    match c {
        '\u{0E50}'..='\u{0E59}' => char::from_digit(c as u32 - 0x0E50, 10),
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' => None,
        '\u{00A0}' => Some(' '),
        '\u{FF0F}' => Some('/'),
        _ => Some(c),
    }
}

fn is_thai_letter(c: char) -> bool {
    matches!(c, '\u{0E01}'..='\u{0E3A}' | '\u{0E40}'..='\u{0E4E}')
}

fn is_thai_consonant(c: char) -> bool {
    matches!(c, '\u{0E01}'..='\u{0E2E}')
}

/// Splits a word where Thai script meets ASCII digits: `รหัส1234` → `รหัส`, `1234`.
fn split_script_runs(word: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev: Option<char> = None;
    for c in word.chars() {
        if let Some(p) = prev {
            let boundary = (is_thai_letter(p) && c.is_ascii_digit()) || (p.is_ascii_digit() && is_thai_letter(c));
            if boundary && !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
        }
        current.push(c);
        prev = Some(c);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Splits a Thai label glued to its value: `ชื่อสมชาย` → `ชื่อ`, `สมชาย`.
fn split_glued_label(word: String) -> Vec<String> {
    if !word.chars().next().is_some_and(is_thai_letter) || match_label(&word).is_some() {
        return vec![word];
    }
    let mut thai_labels: Vec<&str> = LABELS
        .iter()
        .map(|(_, l)| *l)
        .filter(|l| l.chars().next().is_some_and(is_thai_letter))
        .collect();
    thai_labels.sort_by_key(|l| std::cmp::Reverse(l.chars().count()));
    for label in thai_labels {
        if let Some(rest) = word.strip_prefix(label) {
            if rest.chars().count() >= 2 {
                return vec![label.to_string(), rest.to_string()];
            }
        }
    }
    vec![word]
}

fn label_key(text: &str) -> String {
    text.to_lowercase().trim_end_matches(['.', '-']).replace(' ', "")
}

/// Best label for `text`, with whether the match was exact.
fn match_label(text: &str) -> Option<(Label, bool)> {
    let key = label_key(text);
    if key.is_empty() {
        return None;
    }
    if let Some((label, _)) = LABELS.iter().find(|(_, l)| *l == key) {
        return Some((*label, true));
    }
    LABELS
        .iter()
        .filter(|(_, l)| l.chars().count() >= MIN_FUZZY_LABEL_CHARS)
        .map(|(label, l)| (*label, normalized_levenshtein(&key, l)))
        .filter(|(_, score)| *score >= FUZZY_LABEL_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(label, _)| (label, false))
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    label: Label,
    start: usize,
    end: usize,
    exact: bool,
}

fn find_anchors(tokens: &[Token]) -> Vec<Anchor> {
    let mut anchors: Vec<Anchor> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        // Two-word Latin labels ("Student ID", "Last name") only match exactly.
        if let Some(next) = tokens.get(i + 1).filter(|n| n.line == tokens[i].line) {
            let joined = format!("{}{}", tokens[i].text, next.text);
            if let Some((label, true)) = match_label(&joined) {
                anchors.push(Anchor { label, start: i, end: i + 2, exact: true });
                i += 2;
                continue;
            }
        }
        if let Some((label, exact)) = match_label(&tokens[i].text) {
            // The slot right after a label holds its value; only an exact label overrides that.
            let value_slot = anchors.last().is_some_and(|a| a.end == i);
            if exact || !value_slot {
                anchors.push(Anchor { label, start: i, end: i + 1, exact });
            }
        }
        i += 1;
    }
    merge_split_full_name(anchors, tokens)
}

/// `ชื่อ - สกุล` written apart reads as one combined label. Both halves must
/// match exactly.
fn merge_split_full_name(anchors: Vec<Anchor>, tokens: &[Token]) -> Vec<Anchor> {
    let mut merged: Vec<Anchor> = Vec::with_capacity(anchors.len());
    for anchor in anchors {
        if let Some(prev) = merged.last_mut() {
            let only_dashes_between = tokens[prev.end..anchor.start].iter().all(|t| t.text == "-");
            let both_exact = prev.exact && anchor.exact;
            if prev.label == Label::Name && anchor.label == Label::Surname && both_exact && only_dashes_between {
                prev.label = Label::FullName;
                prev.end = anchor.end;
                continue;
            }
        }
        merged.push(anchor);
    }
    merged
}

/// Removes a leading honorific. The flag says whether one was present.
fn strip_honorific(token: &str) -> (&str, bool) {
    let lower = token.to_lowercase();
    for honorific in HONORIFICS {
        if lower == *honorific {
            return ("", true);
        }
        let prefixable = !honorific.is_ascii() || honorific.ends_with('.');
        if prefixable && lower.starts_with(honorific) {
            if let Some(rest) = token.get(honorific.len()..) {
                return (rest, true);
            }
        }
    }
    (token, false)
}

fn is_name_word(word: &str) -> bool {
    word.chars().count() >= 2
        && word.chars().all(|c| is_thai_letter(c) || c.is_ascii_alphabetic() || c == '-')
        && word.chars().any(|c| is_thai_consonant(c) || c.is_ascii_alphabetic())
}

/// Reads a digit run, repairing the usual OCR letter-for-digit swaps.
/// The flag says whether any character had to be repaired.
fn read_digits(token: &str) -> Option<(String, bool)> {
    let mut digits = String::with_capacity(token.len());
    let mut repaired = 0;
    for c in token.chars() {
        let digit = match c {
            '0'..='9' => c,
            'O' | 'o' | 'D' | 'Q' => '0',
            'l' | 'I' | 'i' | '!' => '1',
            'S' | 's' => '5',
            'B' => '8',
            'Z' | 'z' => '2',
            _ => return None,
        };
        if digit != c {
            repaired += 1;
        }
        digits.push(digit);
    }
    let genuine = digits.len() - repaired;
    if genuine == 0 || repaired * 2 > genuine {
        return None;
    }
    Some((digits, repaired > 0))
}

fn has_valid_checksum(digits: &str) -> bool {
    let values: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if values.len() != 13 {
        return false;
    }
    let sum: u32 = values[..12].iter().enumerate().map(|(i, d)| d * (13 - i as u32)).sum();
    (11 - sum % 11) % 10 == values[12]
}

struct Parser<'a> {
    doc: &'a Document,
    anchors: Vec<Anchor>,
    claimed: HashSet<usize>,
}

impl<'a> Parser<'a> {
    fn new(doc: &'a Document) -> Self {
        let anchors = find_anchors(&doc.tokens);
        let claimed = anchors.iter().flat_map(|a| a.start..a.end).collect();
        Self { doc, anchors, claimed }
    }

    fn anchors_for(&self, label: Label) -> Vec<Anchor> {
        self.anchors.iter().filter(|a| a.label == label).copied().collect()
    }

    /// Anchor of `label` ending right before token `index`.
    fn anchor_before(&self, index: usize, label: Label) -> Option<Anchor> {
        self.anchors.iter().find(|a| a.label == label && a.end == index).copied()
    }

    fn claim(&mut self, indices: impl IntoIterator<Item = usize>) {
        self.claimed.extend(indices);
    }

    /// Unclaimed tokens following an anchor, stopping at the next claimed one.
    fn after(&self, anchor: &Anchor) -> Vec<usize> {
        (anchor.end..self.doc.tokens.len())
            .take(VALUE_LOOKAHEAD)
            .take_while(|i| !self.claimed.contains(i))
            .collect()
    }

    fn national_id(&mut self) -> Option<Found<String>> {
        let doc = self.doc;
        for (line_no, line) in doc.lines.iter().enumerate() {
            for caps in NATIONAL_ID.captures_iter(line) {
                let Some(whole) = caps.get(0) else { continue };
                let indices = doc.tokens_in(line_no, whole.start(), whole.end());
                if indices.iter().any(|i| self.claimed.contains(i)) {
                    continue;
                }
                let digits: String = whole.as_str().chars().filter(char::is_ascii_digit).collect();
                let labelled = indices
                    .first()
                    .and_then(|first| self.anchor_before(*first, Label::NationalId))
                    .is_some();
                let confidence = match (has_valid_checksum(&digits), labelled) {
                    (true, true) => 98,
                    (true, false) => 85,
                    (false, true) => 60,
                    (false, false) => 40,
                };
                self.claim(indices);
                return Some(Found::new(digits, confidence));
            }
        }
        None
    }

    fn classroom(&mut self) -> Option<Found<String>> {
        let doc = self.doc;
        for (line_no, line) in doc.lines.iter().enumerate() {
            for caps in CLASSROOM.captures_iter(line) {
                let (Some(whole), Some(grade), Some(room)) = (caps.get(0), caps.get(2), caps.get(3)) else {
                    continue;
                };
                // Dates like 12/05/2567 are not classrooms.
                let before = line[..grade.start()].trim_end();
                let after = line[whole.end()..].trim_start();
                if before.ends_with('/') || after.starts_with('/') {
                    continue;
                }
                let indices = doc.tokens_in(line_no, whole.start(), whole.end());
                if indices.iter().any(|i| self.claimed.contains(i)) {
                    continue;
                }
                let (Ok(grade), Ok(room)) = (grade.as_str().parse::<u8>(), room.as_str().parse::<u8>()) else {
                    continue;
                };
                let anchor = indices.first().and_then(|first| self.anchor_before(*first, Label::Classroom));
                let confidence = match anchor {
                    _ if caps.get(1).is_some() => 90,
                    Some(a) if a.exact => 90,
                    Some(_) => 80,
                    None => 60,
                };
                self.claim(indices);
                return Some(Found::new(format!("{}/{}", grade, room), confidence));
            }
        }
        None
    }

    fn labelled_student_id(&mut self) -> Option<Found<String>> {
        let doc = self.doc;
        for anchor in self.anchors_for(Label::StudentId) {
            for index in self.after(&anchor) {
                let Some((digits, repaired)) = read_digits(&doc.tokens[index].text) else {
                    continue;
                };
                if !(4..=6).contains(&digits.len()) {
                    continue;
                }
                let mut confidence = if anchor.exact { 95 } else { 80 };
                if repaired {
                    confidence -= 15;
                }
                self.claim([index]);
                return Some(Found::new(digits, confidence));
            }
        }
        None
    }

    fn positional_student_id(&mut self) -> Option<Found<String>> {
        let doc = self.doc;
        let index = (0..doc.tokens.len()).find(|i| {
            let text = &doc.tokens[*i].text;
            !self.claimed.contains(i)
                && (4..=6).contains(&text.len())
                && text.chars().all(|c| c.is_ascii_digit())
                && !text.parse::<u32>().is_ok_and(|year| BUDDHIST_ERA_YEARS.contains(&year))
        })?;
        self.claim([index]);
        Some(Found::new(doc.tokens[index].text.clone(), 45))
    }

    fn number(&mut self) -> Option<Found<u32>> {
        let doc = self.doc;
        for anchor in self.anchors_for(Label::Number) {
            for index in self.after(&anchor) {
                let text = &doc.tokens[index].text;
                if !(1..=3).contains(&text.len()) || !text.chars().all(|c| c.is_ascii_digit()) {
                    continue;
                }
                let Ok(value) = text.parse::<u32>() else { continue };
                self.claim([index]);
                return Some(Found::new(value, if anchor.exact { 90 } else { 75 }));
            }
        }
        None
    }

    /// First name word among `indices`, skipping honorifics.
    fn name_word_from(&self, indices: &[usize]) -> Option<(usize, String)> {
        for index in indices {
            let (word, _) = strip_honorific(&self.doc.tokens[*index].text);
            if word.is_empty() {
                continue;
            }
            if is_name_word(word) {
                return Some((*index, word.to_string()));
            }
            return None;
        }
        None
    }

    fn next_name_word(&self, index: usize) -> Option<(usize, String)> {
        let next = index + 1;
        if next >= self.doc.tokens.len() || self.claimed.contains(&next) {
            return None;
        }
        let text = &self.doc.tokens[next].text;
        is_name_word(text).then(|| (next, text.clone()))
    }

    fn names(&mut self) -> (Option<Found<String>>, Option<Found<String>>) {
        let mut name = None;
        let mut surname = None;

        for anchor in self.anchors_for(Label::FullName) {
            if name.is_some() {
                break;
            }
            if let Some((index, word)) = self.name_word_from(&self.after(&anchor)) {
                self.claim([index]);
                name = Some(Found::new(word, if anchor.exact { 85 } else { 70 }));
                if let Some((next, word)) = self.next_name_word(index) {
                    self.claim([next]);
                    surname = Some(Found::new(word, if anchor.exact { 85 } else { 70 }));
                }
            }
        }
        if name.is_none() {
            for anchor in self.anchors_for(Label::Name) {
                if let Some((index, word)) = self.name_word_from(&self.after(&anchor)) {
                    self.claim([index]);
                    name = Some(Found::new(word, if anchor.exact { 90 } else { 75 }));
                    break;
                }
            }
        }
        if surname.is_none() {
            for anchor in self.anchors_for(Label::Surname) {
                if let Some((index, word)) = self.name_word_from(&self.after(&anchor)) {
                    self.claim([index]);
                    surname = Some(Found::new(word, if anchor.exact { 90 } else { 75 }));
                    break;
                }
            }
        }
        if name.is_none() {
            if let Some((index, word)) = self.honorific_led_name() {
                self.claim([index]);
                name = Some(Found::new(word, 70));
                if surname.is_none() {
                    if let Some((next, word)) = self.next_name_word(index) {
                        self.claim([next]);
                        surname = Some(Found::new(word, 60));
                    }
                }
            }
        }
        (name, surname)
    }

    /// First name word introduced by an honorific, glued or standalone.
    fn honorific_led_name(&self) -> Option<(usize, String)> {
        for (index, token) in self.doc.tokens.iter().enumerate() {
            if self.claimed.contains(&index) {
                continue;
            }
            let (rest, had_honorific) = strip_honorific(&token.text);
            if !had_honorific {
                continue;
            }
            if rest.is_empty() {
                if let Some(found) = self.next_name_word(index) {
                    return Some(found);
                }
            } else if is_name_word(rest) {
                return Some((index, rest.to_string()));
            }
        }
        None
    }
}

/// Parses raw OCR text into card fields. Pure; never fails.
pub fn parse_ocr_text(raw: &str) -> ParseResult {
    let doc = Document::parse(raw);
    let mut parser = Parser::new(&doc);

    let national_id = parser.national_id();
    let classroom = parser.classroom();
    let labelled_id = parser.labelled_student_id();
    let no = parser.number();
    let (name, surname) = parser.names();
    let id = labelled_id.or_else(|| parser.positional_student_id());

    let (id, id_conf) = unpack(id);
    let (name, name_conf) = unpack(name);
    let (surname, surname_conf) = unpack(surname);
    let (classroom, classroom_conf) = unpack(classroom);
    let (no, no_conf) = unpack(no);
    let (national_id, national_conf) = unpack(national_id);

    ParseResult {
        id,
        name,
        surname,
        classroom,
        no,
        national_id,
        confidence: FieldConfidence {
            id: id_conf,
            name: name_conf,
            surname: surname_conf,
            classroom: classroom_conf,
            no: no_conf,
            national_id: national_conf,
        },
    }
}

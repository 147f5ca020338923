//! Line-oriented toolpath text interpreter

use super::{Move, MoveKind, ParseResult, Point3, Polyline, Unit};
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Motion token at the start of a line, plus everything after it
fn motion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(RAPID|FEED|G00|G01|G0|G1)(.*)$").expect("valid motion regex")
    })
}

/// Address word: letter, optional spaces, signed decimal
fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)([A-Z])\s*([+-]?(?:\d+\.?\d*|\.\d+))").expect("valid word regex")
    })
}

/// Parenthesised inline comment
fn paren_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*\)?").expect("valid comment regex"))
}

/// Words read from one motion line
#[derive(Debug, Default)]
struct Words {
    x: Option<f64>,
    y: Option<f64>,
    z: Option<f64>,
    f: Option<f64>,
}

/// Interpret toolpath text.
///
/// Never fails: blank lines, comments, unrecognized directives and malformed
/// words are skipped.
pub fn parse(text: &str) -> ParseResult {
    let mut moves = Vec::new();
    let mut feed_values = Vec::new();
    let mut modal_feed: Option<f64> = None;
    let mut saw_mm = false;
    let mut saw_inch = false;
    let mut saw_feed_word = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('(') {
            continue;
        }
        let body = strip_comments(line);
        let body = body.trim();

        for (letter, value) in scan_words(body) {
            if letter == 'G' {
                if value == 21.0 {
                    saw_mm = true;
                } else if value == 20.0 {
                    saw_inch = true;
                }
            }
        }

        let Some((kind, rest)) = split_motion(body) else {
            continue;
        };
        let words = read_words(rest);
        if words.f.is_some() {
            saw_feed_word = true;
        }

        let feed = match kind {
            MoveKind::Feed => {
                let feed = words.f.or(modal_feed);
                if let Some(f) = feed {
                    modal_feed = Some(f);
                    feed_values.push(f);
                }
                feed
            }
            MoveKind::Rapid => words.f,
        };

        moves.push(Move {
            kind,
            x: words.x,
            y: words.y,
            z: words.z,
            feed,
        });
    }

    let unit = match (saw_mm, saw_inch) {
        (true, false) => Unit::Mm,
        (false, true) => Unit::Inch,
        _ => Unit::Unknown,
    };
    let has_feed_moves = moves.iter().any(|m| m.kind == MoveKind::Feed);
    let polylines = build_polylines(&moves);

    debug!(
        moves = moves.len(),
        polylines = polylines.len(),
        unit = %unit,
        "Parsed toolpath"
    );

    ParseResult {
        polylines,
        unit,
        feed_values,
        moves,
        feed_declared: !has_feed_moves || saw_feed_word,
    }
}

/// Remove `( ... )` comments and anything after `;`
fn strip_comments(line: &str) -> String {
    let without_semi = line.split(';').next().unwrap_or("");
    paren_comment_re().replace_all(without_semi, " ").into_owned()
}

/// Recognize a motion token at the start of the line.
///
/// The token must be followed by whitespace, an address letter, or nothing,
/// so `G10` or `FEEDRATE` are not mistaken for motion.
fn split_motion(body: &str) -> Option<(MoveKind, &str)> {
    let caps = motion_re().captures(body)?;
    let token = caps.get(1)?.as_str().to_ascii_uppercase();
    let rest = caps.get(2).map_or("", |m| m.as_str());

    match rest.chars().next() {
        None => {}
        Some(c) if c.is_whitespace() || c.is_ascii_alphabetic() => {
            if c.is_ascii_alphabetic() && (token == "RAPID" || token == "FEED") {
                return None;
            }
        }
        Some(_) => return None,
    }

    let kind = match token.as_str() {
        "RAPID" | "G0" | "G00" => MoveKind::Rapid,
        _ => MoveKind::Feed,
    };
    Some((kind, rest))
}

fn scan_words(body: &str) -> impl Iterator<Item = (char, f64)> + '_ {
    word_re().captures_iter(body).filter_map(|caps| {
        let letter = caps.get(1)?.as_str().chars().next()?.to_ascii_uppercase();
        let value = caps.get(2)?.as_str().parse::<f64>().ok()?;
        Some((letter, value))
    })
}

/// First occurrence of each axis/feed word wins
fn read_words(rest: &str) -> Words {
    let mut words = Words::default();
    for (letter, value) in scan_words(rest) {
        let slot = match letter {
            'X' => &mut words.x,
            'Y' => &mut words.y,
            'Z' => &mut words.z,
            'F' if value >= 0.0 => &mut words.f,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }
    words
}

/// Resolve modal positions and split into kind-homogeneous polylines
fn build_polylines(moves: &[Move]) -> Vec<Polyline> {
    let mut polylines = Vec::new();
    let mut position: Point3 = [0.0, 0.0, 0.0];
    let mut current: Option<Polyline> = None;

    for mv in moves {
        position = [
            mv.x.unwrap_or(position[0]),
            mv.y.unwrap_or(position[1]),
            mv.z.unwrap_or(position[2]),
        ];

        match current.as_mut() {
            Some(buf) if buf.kind == mv.kind => buf.points.push(position),
            _ => {
                flush(&mut polylines, current.take());
                current = Some(Polyline {
                    kind: mv.kind,
                    points: vec![position],
                });
            }
        }
    }
    flush(&mut polylines, current);

    polylines
}

fn flush(polylines: &mut Vec<Polyline>, buffer: Option<Polyline>) {
    if let Some(buf) = buffer {
        if buf.points.len() >= 2 {
            polylines.push(buf);
        }
    }
}

//! PGN game-block parsing and metadata screening.
//!
//! The pipeline slices the archive into blank-line-delimited blocks and
//! hands each block here. Header parsing, move-token extraction and the
//! bullet/invalid screening all live in this module; board semantics do not
//! (see [`crate::trainer::encoder`]).

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\[(\w+)\s+"([^"]*)"\]"#).expect("valid header regex"));

/// SAN and long-algebraic move tokens; capture 2 is the move itself.
static MOVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+\.+)?\s*([NBRQKO]?[a-h]?[1-8]?x?[a-h][1-8](?:=[NBRQ])?[+#]?|O-O(?:-O)?)")
        .expect("valid move regex")
});

static STRIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    // Comments, variations and result markers are noise for token extraction.
    Regex::new(r"\{[^}]*\}|\([^)]*\)|1-0|0-1|1/2-1/2|\*").expect("valid strip regex")
});

/// One blank-line-delimited game block, not yet screened.
#[derive(Debug, Clone)]
pub struct RawGame {
    pub headers: HashMap<String, String>,
    pub moves_text: String,
}

/// Why a game was skipped. Counted, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    /// Disallowed time-control class.
    Bullet,
    /// Missing rating fields, unparseable headers or no extractable moves.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    WhiteWin,
    BlackWin,
    Draw,
    Unknown,
}

impl GameResult {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("1-0") => GameResult::WhiteWin,
            Some("0-1") => GameResult::BlackWin,
            Some("1/2-1/2") => GameResult::Draw,
            _ => GameResult::Unknown,
        }
    }
}

/// A screened game ready for encoding. Lives only while one game is being
/// converted into samples.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    pub white_elo: i32,
    pub black_elo: i32,
    pub white_rating_diff: i32,
    pub black_rating_diff: i32,
    pub result: GameResult,
    pub link: Option<String>,
    pub moves: Vec<String>,
}

impl RawGame {
    /// Split a game block into `[Key "Value"]` headers and move text.
    pub fn parse(block: &str) -> Self {
        let mut headers = HashMap::new();
        let mut moves_text = String::new();
        for line in block.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(caps) = HEADER_RE.captures(line) {
                headers.insert(caps[1].to_string(), caps[2].to_string());
            } else if !line.starts_with('[') {
                if !moves_text.is_empty() {
                    moves_text.push(' ');
                }
                moves_text.push_str(line);
            }
        }
        Self { headers, moves_text }
    }
}

/// Apply the metadata filters and produce a [`GameRecord`], or the reason
/// the game is skipped.
pub fn screen(raw: &RawGame) -> Result<GameRecord, FilterReason> {
    if let Some(tc) = raw.headers.get("TimeControl")
        && (tc.starts_with("60+") || tc.contains("bullet"))
    {
        return Err(FilterReason::Bullet);
    }

    let white_elo = parse_int(raw.headers.get("WhiteElo"));
    let black_elo = parse_int(raw.headers.get("BlackElo"));
    if white_elo == 0 || black_elo == 0 {
        return Err(FilterReason::Invalid);
    }

    let moves = extract_moves(&raw.moves_text);
    if moves.is_empty() {
        return Err(FilterReason::Invalid);
    }

    Ok(GameRecord {
        white_elo,
        black_elo,
        white_rating_diff: parse_int(raw.headers.get("WhiteRatingDiff")),
        black_rating_diff: parse_int(raw.headers.get("BlackRatingDiff")),
        result: GameResult::parse(raw.headers.get("Result").map(String::as_str)),
        link: raw.headers.get("Site").cloned(),
        moves,
    })
}

/// Strip comments/variations/results and collect the move tokens.
pub fn extract_moves(moves_text: &str) -> Vec<String> {
    let cleaned = STRIP_RE.replace_all(moves_text, " ");
    MOVE_RE.captures_iter(&cleaned).map(|caps| caps[2].trim().to_string()).collect()
}

fn parse_int(s: Option<&String>) -> i32 {
    s.and_then(|v| v.trim_start_matches('+').parse().ok()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAME: &str = concat!(
        "[Event \"Rated Blitz game\"]\n",
        "[Site \"https://lichess.org/abcd1234\"]\n",
        "[Result \"1-0\"]\n",
        "[WhiteElo \"1830\"]\n",
        "[BlackElo \"1790\"]\n",
        "[WhiteRatingDiff \"+7\"]\n",
        "[BlackRatingDiff \"-7\"]\n",
        "[TimeControl \"300+3\"]\n",
        "\n",
        "1. e4 e5 2. Nf3 { book move } Nc6 3. Bb5 a6 1-0\n",
    );

    #[test]
    fn parses_headers_and_moves() {
        let raw = RawGame::parse(GAME);
        assert_eq!(raw.headers["WhiteElo"], "1830");
        assert_eq!(raw.headers["Site"], "https://lichess.org/abcd1234");

        let game = screen(&raw).expect("valid game");
        assert_eq!(game.white_elo, 1830);
        assert_eq!(game.white_rating_diff, 7);
        assert_eq!(game.black_rating_diff, -7);
        assert_eq!(game.result, GameResult::WhiteWin);
        assert_eq!(game.moves, vec!["e4", "e5", "Nf3", "Nc6", "Bb5", "a6"]);
    }

    #[test]
    fn bullet_time_control_is_filtered() {
        let mut raw = RawGame::parse(GAME);
        raw.headers.insert("TimeControl".into(), "60+0".into());
        assert_eq!(screen(&raw), Err(FilterReason::Bullet));
    }

    #[test]
    fn missing_ratings_are_invalid() {
        let mut raw = RawGame::parse(GAME);
        raw.headers.remove("BlackElo");
        assert_eq!(screen(&raw), Err(FilterReason::Invalid));
    }

    #[test]
    fn empty_movetext_is_invalid() {
        let mut raw = RawGame::parse(GAME);
        raw.moves_text = "{ abandoned } 1-0".into();
        assert_eq!(screen(&raw), Err(FilterReason::Invalid));
    }

    #[test]
    fn extract_strips_annotations() {
        let moves = extract_moves("1. d4 ( 1. e4 e5 ) d5 2. c4 {gambit} dxc4 1/2-1/2");
        assert_eq!(moves, vec!["d4", "d5", "c4", "dxc4"]);
    }
}

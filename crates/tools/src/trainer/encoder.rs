//! Board/move encoding seam between the pipeline and the chess world.
//!
//! The pipeline never interprets board semantics itself; it consumes
//! [`TrainingSample`]s from a [`GameEncoder`]. The bundled
//! [`CoordinateEncoder`] understands plain coordinate move tokens
//! (`e2e4`-style) and keeps a piece-placement vector by relocating pieces,
//! which is enough for coordinate-notation archives and for tests. Archives
//! in full SAN need a real rules engine behind this trait.

use crate::trainer::pgn::{GameRecord, GameResult};
use prophet_core::TrainingSample;

/// Converts one screened game into zero or more training samples.
pub trait GameEncoder: Send + Sync {
    /// Length of every board vector this encoder emits (turn flag included).
    fn board_width(&self) -> usize;
    /// Size of the categorical move space.
    fn move_space(&self) -> usize;
    /// Per-ply samples for `game`. Too-short or unparseable games yield an
    /// empty vector, never an error.
    fn samples(&self, game: &GameRecord) -> Vec<TrainingSample>;
}

/// 64 signed piece codes plus a side-to-move flag, moves as `from*64 + to`.
#[derive(Debug, Clone)]
pub struct CoordinateEncoder {
    /// Games with fewer plies than this yield no samples.
    pub min_plies: usize,
    /// At most this many samples are taken from one game (opening bias is
    /// deliberate: early positions recur across games, endgames do not).
    pub max_plies: usize,
}

/// 64 squares + 1 turn flag.
pub const BOARD_WIDTH: usize = 65;
/// `64 * 64` from/to combinations.
pub const MOVE_SPACE: usize = 64 * 64;

impl Default for CoordinateEncoder {
    fn default() -> Self {
        Self { min_plies: 5, max_plies: 25 }
    }
}

impl CoordinateEncoder {
    pub fn encode_move(from: usize, to: usize) -> usize {
        from * 64 + to
    }

    pub fn decode_move(index: usize) -> (usize, usize) {
        (index / 64, index % 64)
    }

    /// `0 -> "a1"`, `63 -> "h8"`.
    pub fn square_to_string(square: usize) -> String {
        let file = (b'a' + (square % 8) as u8) as char;
        let rank = (b'1' + (square / 8) as u8) as char;
        format!("{file}{rank}")
    }

    pub fn string_to_square(s: &str) -> Option<usize> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return None;
        }
        let file = bytes[0].checked_sub(b'a')?;
        let rank = bytes[1].checked_sub(b'1')?;
        if file > 7 || rank > 7 {
            return None;
        }
        Some(rank as usize * 8 + file as usize)
    }

    /// `"e2e4"` / `"e7e8q"` style tokens only.
    fn parse_token(token: &str) -> Option<(usize, usize)> {
        if token.len() < 4 {
            return None;
        }
        let from = Self::string_to_square(token.get(0..2)?)?;
        let to = Self::string_to_square(token.get(2..4)?)?;
        Some((from, to))
    }

    /// Gradient scale for one ply: sign from the mover's eventual outcome,
    /// magnitude from the mover's rating and rating delta.
    fn outcome_weight(game: &GameRecord, white_to_move: bool) -> f32 {
        let base = match (game.result, white_to_move) {
            (GameResult::WhiteWin, true) | (GameResult::BlackWin, false) => 1.0,
            (GameResult::WhiteWin, false) | (GameResult::BlackWin, true) => -1.0,
            _ => 0.25,
        };
        let (elo, diff) = if white_to_move {
            (game.white_elo, game.white_rating_diff)
        } else {
            (game.black_elo, game.black_rating_diff)
        };
        let elo_factor = (elo as f32 / 1500.0).clamp(0.1, 2.0);
        let rating_factor = (1.0 + diff as f32 / 100.0).clamp(0.1, 2.0);
        base * elo_factor * rating_factor
    }
}

/// White pieces positive, black negative: P=1 N=2 B=3 R=4 Q=5 K=6.
fn start_position() -> [i32; 64] {
    let mut board = [0i32; 64];
    let back = [4, 2, 3, 5, 6, 3, 2, 4];
    for (file, piece) in back.iter().enumerate() {
        board[file] = *piece;
        board[8 + file] = 1;
        board[48 + file] = -1;
        board[56 + file] = -piece;
    }
    board
}

impl GameEncoder for CoordinateEncoder {
    fn board_width(&self) -> usize {
        BOARD_WIDTH
    }

    fn move_space(&self) -> usize {
        MOVE_SPACE
    }

    fn samples(&self, game: &GameRecord) -> Vec<TrainingSample> {
        if game.moves.len() < self.min_plies {
            return Vec::new();
        }

        let mut board = start_position();
        let mut white_to_move = true;
        let mut samples = Vec::with_capacity(game.moves.len().min(self.max_plies));

        for token in game.moves.iter().take(self.max_plies) {
            // A token this encoder cannot read ends the game's sample
            // stream; whatever was extracted so far is still usable.
            let Some((from, to)) = Self::parse_token(token) else {
                break;
            };
            if board[from] == 0 {
                break;
            }

            let mut state = Vec::with_capacity(BOARD_WIDTH);
            state.extend_from_slice(&board);
            state.push(if white_to_move { 0 } else { 1 });

            samples.push(TrainingSample::new(
                state,
                Self::encode_move(from, to),
                Self::outcome_weight(game, white_to_move),
            ));

            board[to] = board[from];
            board[from] = 0;
            white_to_move = !white_to_move;
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::pgn::GameResult;

    fn coordinate_game(moves: &[&str], result: GameResult) -> GameRecord {
        GameRecord {
            white_elo: 1500,
            black_elo: 1500,
            white_rating_diff: 0,
            black_rating_diff: 0,
            result,
            link: None,
            moves: moves.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn move_index_round_trip() {
        for (from, to) in [(0, 63), (12, 28), (63, 0)] {
            let idx = CoordinateEncoder::encode_move(from, to);
            assert!(idx < MOVE_SPACE);
            assert_eq!(CoordinateEncoder::decode_move(idx), (from, to));
        }
    }

    #[test]
    fn square_string_round_trip() {
        assert_eq!(CoordinateEncoder::square_to_string(0), "a1");
        assert_eq!(CoordinateEncoder::square_to_string(63), "h8");
        for sq in 0..64 {
            let s = CoordinateEncoder::square_to_string(sq);
            assert_eq!(CoordinateEncoder::string_to_square(&s), Some(sq));
        }
        assert_eq!(CoordinateEncoder::string_to_square("i9"), None);
        assert_eq!(CoordinateEncoder::string_to_square("e"), None);
    }

    #[test]
    fn samples_track_board_and_outcome() {
        let enc = CoordinateEncoder::default();
        let game = coordinate_game(
            &["e2e4", "e7e5", "g1f3", "b8c6", "f1b5", "a7a6"],
            GameResult::WhiteWin,
        );
        let samples = enc.samples(&game);
        assert_eq!(samples.len(), 6);

        let e2 = CoordinateEncoder::string_to_square("e2").unwrap();
        let e4 = CoordinateEncoder::string_to_square("e4").unwrap();
        let first = &samples[0];
        assert_eq!(first.board.len(), BOARD_WIDTH);
        assert_eq!(first.board[e2], 1, "white pawn still on e2 before the move");
        assert_eq!(first.board[64], 0, "white to move");
        assert_eq!(first.target_move, CoordinateEncoder::encode_move(e2, e4));
        assert!(first.outcome_weight > 0.0, "winner's move weighs positive");

        let second = &samples[1];
        assert_eq!(second.board[e4], 1, "pawn relocated to e4");
        assert_eq!(second.board[e2], 0);
        assert_eq!(second.board[64], 1, "black to move");
        assert!(second.outcome_weight < 0.0, "loser's move weighs negative");
    }

    #[test]
    fn draws_weigh_small_and_neutral() {
        let enc = CoordinateEncoder::default();
        let game = coordinate_game(&["e2e4", "e7e5", "g1f3", "b8c6", "f1b5"], GameResult::Draw);
        for s in enc.samples(&game) {
            assert!(s.outcome_weight > 0.0 && s.outcome_weight < 0.5);
        }
    }

    #[test]
    fn short_games_yield_nothing() {
        let enc = CoordinateEncoder::default();
        let game = coordinate_game(&["e2e4", "e7e5"], GameResult::WhiteWin);
        assert!(enc.samples(&game).is_empty());
    }

    #[test]
    fn san_tokens_stop_the_stream_without_error() {
        let enc = CoordinateEncoder::default();
        let game = coordinate_game(
            &["e2e4", "e7e5", "Nf3", "b8c6", "f1b5"],
            GameResult::WhiteWin,
        );
        assert_eq!(enc.samples(&game).len(), 2);
    }

    #[test]
    fn long_games_are_capped() {
        let enc = CoordinateEncoder::default();
        // Shuttle a knight back and forth for 40 plies.
        let mut moves = Vec::new();
        for _ in 0..10 {
            moves.extend_from_slice(&["g1f3", "g8f6", "f3g1", "f6g8"]);
        }
        let game = coordinate_game(&moves, GameResult::Unknown);
        assert_eq!(enc.samples(&game).len(), enc.max_plies);
    }
}

//! Letter tiles on the shared table.

/// `last_player` value meaning no player has touched the tile yet.
pub const NO_PLAYER: u8 = 0xff;

/// Spacing of the grid that freshly drawn tiles land on.
pub const GRID_SPACING: i16 = 20;

/// Number of tiles per grid row before wrapping to the next one.
pub const GRID_COLUMNS: u8 = 10;

/// A single letter tile.
///
/// Tiles are materialized when the bag is filled at game start and keep
/// their index for the life of the conversation. A tile is either still in
/// the bag or face-up on the table, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Stable index of the tile, assigned in draw order at bag fill.
    pub index: u8,

    /// The letter shown on the tile. One character, at most 4 bytes of
    /// UTF-8.
    pub letter: &'static str,

    pub x: i16,
    pub y: i16,

    /// Seat number of the last player to move the tile, or [`NO_PLAYER`].
    pub last_player: u8,

    pub in_bag: bool,
}

impl Tile {
    pub fn in_bag(index: u8, letter: &'static str) -> Tile {
        Tile {
            index,
            letter,
            x: 0,
            y: 0,
            last_player: NO_PLAYER,
            in_bag: true,
        }
    }
}

/// The grid position a tile lands on when it is the `nth` tile drawn onto
/// the table.
pub fn grid_position(nth: u8) -> (i16, i16) {
    let col = (nth % GRID_COLUMNS) as i16;
    let row = (nth / GRID_COLUMNS) as i16;
    (col * GRID_SPACING, row * GRID_SPACING)
}

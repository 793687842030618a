//! Built-in cursor bitmaps.
//!
//! One arrow, drawn once at 16x16 and scaled (nearest neighbour) to the sizes
//! the icon selection picks from.

use once_cell::sync::Lazy;

use super::CursorIcon;

const OPAQUE_BLACK: u32 = 0xFF00_0000;
const OPAQUE_WHITE: u32 = 0xFFFF_FFFF;
const TRANSPARENT: u32 = 0x0000_0000;

/// `X` outline, `.` fill, space transparent. The tip is the hotspot.
const ARROW: [&str; 16] = [
    "X               ",
    "XX              ",
    "X.X             ",
    "X..X            ",
    "X...X           ",
    "X....X          ",
    "X.....X         ",
    "X......X        ",
    "X.......X       ",
    "X........X      ",
    "X.....XXXXX     ",
    "X..X..X         ",
    "X.X X..X        ",
    "XX  X..X        ",
    "X    X..X       ",
    "     XXXX       ",
];

const ARROW_HOTSPOT: (u32, u32) = (0, 0);

/// Icon widths of the built-in set, smallest first.
pub const ICON_SIZES: [u32; 5] = [32, 40, 48, 64, 80];

static DEFAULT_ICONS: Lazy<Vec<CursorIcon>> = Lazy::new(|| ICON_SIZES.iter().map(|size| arrow(*size)).collect());

/// The built-in icon set.
pub fn default_icons() -> &'static [CursorIcon] {
    &DEFAULT_ICONS
}

fn pixel(symbol: u8) -> u32 {
    match symbol {
        b'X' => OPAQUE_BLACK,
        b'.' => OPAQUE_WHITE,
        _ => TRANSPARENT,
    }
}

/// The arrow scaled to `size` x `size` pixels.
fn arrow(size: u32) -> CursorIcon {
    let base = ARROW.len() as u32;
    let mut data = Vec::with_capacity((size * size) as usize);
    for y in 0..size {
        let row = ARROW[(y * base / size) as usize].as_bytes();
        for x in 0..size {
            data.push(pixel(row[(x * base / size) as usize]));
        }
    }
    CursorIcon {
        width: size,
        hot_x: ARROW_HOTSPOT.0 * size / base,
        hot_y: ARROW_HOTSPOT.1 * size / base,
        data,
    }
}

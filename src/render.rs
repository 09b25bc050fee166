//! The character grid that diagrams are drawn onto, and the cursor that
//! events draw through.

use console::Style;

/// Starting column of the first lane. The spare column on the left gives
/// events room to draw bracket glyphs by backtracking one step.
pub const LSHIFT: usize = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Colour {
    Default,
    White,
    Red,
    RedBold,
    GreenBold,
    Yellow,
    BlueBold,
    Magenta,
}

impl Colour {
    fn style(self) -> Option<Style> {
        match self {
            Colour::Default | Colour::White => None,
            Colour::Red => Some(Style::new().red()),
            Colour::RedBold => Some(Style::new().red().bold()),
            Colour::GreenBold => Some(Style::new().green().bold()),
            Colour::Yellow => Some(Style::new().yellow()),
            Colour::BlueBold => Some(Style::new().blue().bold()),
            Colour::Magenta => Some(Style::new().magenta()),
        }
    }
}

/// Colours the events draw with.
pub const EXITED_COLOUR: Colour = Colour::GreenBold;
pub const KILLED_COLOUR: Colour = Colour::RedBold;
pub const SIGNAL_COLOUR: Colour = Colour::Yellow;
pub const EXEC_COLOUR: Colour = Colour::BlueBold;
pub const BAD_EXEC_COLOUR: Colour = Colour::Red;
pub const BAD_WAIT_COLOUR: Colour = Colour::Red;
pub const SIGNAL_SEND_COLOUR: Colour = Colour::Magenta;

/// A fixed-size grid of coloured characters. Writes outside the grid are
/// clipped, matching how a curses pad would behave.
pub struct Grid {
    width: usize,
    height: usize,
    cells: Vec<(char, Colour)>,
}

impl Grid {
    fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![(' ', Colour::Default); width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cell(&self, x: usize, y: usize) -> (char, Colour) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x]
        } else {
            (' ', Colour::Default)
        }
    }

    fn put(&mut self, x: usize, y: usize, ch: char, colour: Colour) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = (ch, colour);
        }
    }

    /// Render each row as a string, with ANSI colours if asked for.
    /// Trailing blanks are trimmed.
    pub fn to_strings(&self, colour: bool) -> Vec<String> {
        let mut out = Vec::with_capacity(self.height);
        for y in 0..self.height {
            let row = &self.cells[y * self.width..(y + 1) * self.width];
            let end = row
                .iter()
                .rposition(|(ch, _)| *ch != ' ')
                .map_or(0, |pos| pos + 1);
            let mut line = String::new();
            for &(ch, c) in &row[..end] {
                match c.style().filter(|_| colour) {
                    Some(style) => line.push_str(&style.apply_to(ch).to_string()),
                    None => line.push(ch),
                }
            }
            out.push(line);
        }
        out
    }
}

/// The drawing cursor. Tracks the rightmost column written on the current
/// line (the x-extent) so we can tell when lanes are too narrow: any draw
/// that lands left of the extent means two lanes collided.
pub struct Drawer {
    grid: Grid,
    lane_width: usize,
    x: usize,
    y: usize,
    x_extent: usize,
    truncated: bool,
}

/// The operations events draw themselves with.
pub trait EventRenderer {
    /// Move the cursor back (to the left).
    fn backtrack(&mut self, steps: usize);

    /// Draw a character `count` times in the given colour.
    fn draw_char(&mut self, colour: Colour, ch: char, count: usize);

    fn draw_string(&mut self, colour: Colour, s: &str);
}

impl Drawer {
    pub fn new(lane_width: usize, num_lanes: usize, num_lines: usize) -> Self {
        Self {
            grid: Grid::new(num_lanes * lane_width + LSHIFT, num_lines * 2),
            lane_width,
            x: 0,
            y: 0,
            x_extent: 0,
            truncated: false,
        }
    }

    pub fn lane_width(&self) -> usize {
        self.lane_width
    }

    pub fn start_line(&mut self, line: usize) {
        self.x_extent = 0;
        self.x = 0;
        self.y = line * 2;
    }

    pub fn start_lane(&mut self, lane: usize) {
        self.x = lane * self.lane_width + LSHIFT;
        if self.x < self.x_extent {
            self.truncated = true;
        }
    }

    /// Pad from the cursor to the end of the current lane with a link's fill
    /// character. Deliberately leaves the x-extent alone: events drawn over
    /// the fill shouldn't count as truncation.
    pub fn draw_link(&mut self, colour: Colour, ch: char) {
        let lane_start = (self.x - LSHIFT) / self.lane_width * self.lane_width + LSHIFT;
        let padding = lane_start + self.lane_width - self.x;
        for i in 0..padding {
            self.grid.put(self.x + i, self.y, ch, colour);
        }
        self.x += padding;
    }

    /// Continue a lane's path on the inter-line row below the current line.
    pub fn draw_continuation(&mut self, lane: usize, colour: Colour, ch: char) {
        self.grid
            .put(lane * self.lane_width + LSHIFT, self.y + 1, ch, colour);
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_grid(self) -> Grid {
        self.grid
    }
}

impl EventRenderer for Drawer {
    fn backtrack(&mut self, steps: usize) {
        self.x = self.x.saturating_sub(steps);
        if self.x < self.x_extent {
            self.truncated = true;
        }
    }

    fn draw_char(&mut self, colour: Colour, ch: char, count: usize) {
        for i in 0..count {
            self.grid.put(self.x + i, self.y, ch, colour);
        }
        self.x += count;
        self.x_extent = self.x;
    }

    fn draw_string(&mut self, colour: Colour, s: &str) {
        for (i, ch) in s.chars().enumerate() {
            self.grid.put(self.x + i, self.y, ch, colour);
        }
        self.x += s.chars().count();
        self.x_extent = self.x;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_are_column_exact() {
        let mut drawer = Drawer::new(4, 2, 1);
        drawer.start_line(0);
        drawer.start_lane(0);
        drawer.draw_char(Colour::Default, '+', 1);
        drawer.draw_link(Colour::Default, '-');
        drawer.start_lane(1);
        drawer.draw_string(Colour::Default, "0");
        let grid = drawer.into_grid();
        let lines = grid.to_strings(false);
        assert_eq!(lines[0], " +---0");
    }

    #[test]
    fn truncation_flags_leftward_collisions() {
        // Lane width 2, an event 3 chars wide in lane 0, then lane 1 starts
        // left of the extent.
        let mut drawer = Drawer::new(2, 2, 1);
        drawer.start_line(0);
        drawer.start_lane(0);
        drawer.draw_string(Colour::Default, "123");
        assert!(!drawer.truncated());
        drawer.start_lane(1);
        assert!(drawer.truncated());
    }

    #[test]
    fn backtrack_into_previous_extent_truncates() {
        let mut drawer = Drawer::new(4, 2, 1);
        drawer.start_line(0);
        drawer.start_lane(0);
        drawer.draw_char(Colour::Default, '|', 1);
        drawer.start_lane(1);
        // Lane 1 starts at column 5; backtracking one step is fine since the
        // extent is only 2.
        drawer.backtrack(1);
        assert!(!drawer.truncated());
        drawer.backtrack(3);
        assert!(drawer.truncated());
    }

    #[test]
    fn link_fill_does_not_move_extent() {
        let mut drawer = Drawer::new(4, 2, 1);
        drawer.start_line(0);
        drawer.start_lane(0);
        drawer.draw_char(Colour::Default, '+', 1);
        drawer.draw_link(Colour::Default, '-');
        // The link filled to column 5, but the extent is still 2, so
        // starting lane 1 at column 5 is not a collision.
        drawer.start_lane(1);
        assert!(!drawer.truncated());
    }
}

use crate::types::OpenPercentage;

/// Reconciles continuous drag and slider input with committed window positions
///
/// Movement only updates the visual position. A value is committed (and should be
/// written to the peripheral) only on drag release or slider commit, which bounds BLE
/// traffic to one write per user action.
#[derive(Debug, Clone)]
pub struct GestureTracker {
    pane_width: f64,
    last_position: f64,
    visual: OpenPercentage,
}

impl GestureTracker {
    /// Create a tracker for a pane of the given width. Non-positive widths are
    /// treated as one unit.
    #[must_use]
    pub fn new(pane_width: f64) -> Self {
        let pane_width = if pane_width.is_finite() && pane_width > 0.0 {
            pane_width
        } else {
            1.0
        };

        Self {
            pane_width,
            last_position: 0.0,
            visual: OpenPercentage::CLOSED,
        }
    }

    /// Percentage currently shown on screen
    #[must_use]
    pub const fn visual(&self) -> OpenPercentage {
        self.visual
    }

    /// Pane offset currently shown on screen
    #[must_use]
    pub fn position(&self) -> f64 {
        self.visual.value() / 100.0 * self.pane_width
    }

    fn position_for(&self, dx: f64) -> f64 {
        // a non-finite delta would poison the drag origin
        let dx = if dx.is_finite() { dx } else { 0.0 };
        (self.last_position + dx).clamp(0.0, self.pane_width)
    }

    fn percentage_at(&self, position: f64) -> OpenPercentage {
        OpenPercentage::new(position / self.pane_width * 100.0)
    }

    /// Drag moved by `dx` since the gesture started. Visual only.
    pub fn drag_move(&mut self, dx: f64) -> OpenPercentage {
        let position = self.position_for(dx);
        self.visual = self.percentage_at(position);
        self.visual
    }

    /// Drag released after moving `dx`. Returns the committed value.
    pub fn drag_release(&mut self, dx: f64) -> OpenPercentage {
        let position = self.position_for(dx);
        self.last_position = position;
        self.visual = self.percentage_at(position);
        self.visual
    }

    /// Slider moved to `value`. Visual only.
    pub fn slider_change(&mut self, value: f64) -> OpenPercentage {
        self.visual = OpenPercentage::new(value);
        self.last_position = self.visual.value() / 100.0 * self.pane_width;
        self.visual
    }

    /// Slider released at `value`. Returns the committed value.
    pub fn slider_commit(&mut self, value: f64) -> OpenPercentage {
        self.slider_change(value)
    }

    /// Snap back to closed
    pub fn reset(&mut self) {
        self.last_position = 0.0;
        self.visual = OpenPercentage::CLOSED;
    }
}

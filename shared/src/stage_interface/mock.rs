use super::{StageActuator, StageError, StageResult};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MockStageState {
    z_um: f64,
    travel: Option<(f64, f64)>,
    readback: bool,
    readback_offset_um: f64,
    fail_readback: bool,
    fail_next_moves: usize,
    fail_move_indices: HashSet<usize>,
    move_attempts: usize,
    commands: Vec<f64>,
}

/// In-memory Z stage with shared state
///
/// Clones share the same position, so a simulated camera can hold one clone
/// while the controller owns another.
#[derive(Debug, Clone)]
pub struct MockStage {
    state: Arc<Mutex<MockStageState>>,
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl MockStage {
    pub fn new(initial_z_um: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockStageState {
                z_um: initial_z_um,
                readback: true,
                ..Default::default()
            })),
        }
    }

    /// Reject moves outside `[min_um, max_um]` like a real controller would
    pub fn with_travel(self, min_um: f64, max_um: f64) -> Self {
        self.lock().travel = Some((min_um, max_um));
        self
    }

    /// Report no independent position sensor
    pub fn without_readback(self) -> Self {
        self.lock().readback = false;
        self
    }

    /// Add a constant error to every readback
    pub fn with_readback_offset(self, offset_um: f64) -> Self {
        self.lock().readback_offset_um = offset_um;
        self
    }

    /// Fail the next `count` move commands
    pub fn fail_next_moves(&self, count: usize) {
        self.lock().fail_next_moves = count;
    }

    /// Fail the move attempts with these zero-based indices
    pub fn fail_move_attempts(&self, indices: impl IntoIterator<Item = usize>) {
        self.lock().fail_move_indices.extend(indices);
    }

    /// Make `get_z_um` fail until cleared
    pub fn set_readback_failure(&self, fail: bool) {
        self.lock().fail_readback = fail;
    }

    /// True stage position, independent of readback faults
    pub fn position_um(&self) -> f64 {
        self.lock().z_um
    }

    /// Teleport the stage without logging a command
    pub fn set_position_um(&self, z_um: f64) {
        self.lock().z_um = z_um;
    }

    /// Every accepted command in order
    pub fn commands(&self) -> Vec<f64> {
        self.lock().commands.clone()
    }

    /// Number of accepted commands
    pub fn command_count(&self) -> usize {
        self.lock().commands.len()
    }

    /// Number of move attempts, accepted or not
    pub fn move_attempts(&self) -> usize {
        self.lock().move_attempts
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    fn lock(&self) -> MutexGuard<'_, MockStageState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StageActuator for MockStage {
    fn get_z_um(&mut self) -> StageResult<f64> {
        let state = self.lock();
        if state.fail_readback {
            return Err(StageError::Communication(
                "mock readback failure".to_string(),
            ));
        }
        Ok(state.z_um + state.readback_offset_um)
    }

    fn move_z_um(&mut self, target_um: f64) -> StageResult<()> {
        let mut state = self.lock();
        let attempt = state.move_attempts;
        state.move_attempts += 1;

        if state.fail_next_moves > 0 {
            state.fail_next_moves -= 1;
            return Err(StageError::CommandRejected {
                target_um,
                reason: "mock injected failure".to_string(),
            });
        }
        if state.fail_move_indices.remove(&attempt) {
            return Err(StageError::CommandRejected {
                target_um,
                reason: format!("mock injected failure on attempt {attempt}"),
            });
        }
        if !target_um.is_finite() {
            return Err(StageError::CommandRejected {
                target_um,
                reason: "non-finite target".to_string(),
            });
        }
        if let Some((min_um, max_um)) = state.travel {
            if target_um < min_um || target_um > max_um {
                return Err(StageError::OutOfRange {
                    target_um,
                    min_um,
                    max_um,
                });
            }
        }

        state.z_um = target_um;
        state.commands.push(target_um);
        Ok(())
    }

    fn supports_readback(&self) -> bool {
        self.lock().readback
    }
}

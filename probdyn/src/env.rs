/// Reinforcement learning environment interface.
///
/// Each call to [`Env::step`] advances the simulation by one action and
/// returns `(observation, reward, done)`.
pub trait Env {
    fn step(&mut self, action: f32) -> (Vec<f32>, f32, bool);

    /// Resets to the starting state and returns the initial observation.
    fn reset(&mut self) -> Vec<f32>;

    fn obs_size(&self) -> usize;

    fn action_size(&self) -> usize;
}

/// A sphere rolling along a line, pushed by a horizontal force.
///
/// The observation is `[position, velocity]`; the reward is the displacement
/// made during the step. The episode ends once the sphere leaves
/// `[-bound, bound]`.
#[derive(Clone, Debug)]
pub struct RollingSphereEnv {
    pub position: f32,
    pub velocity: f32,
    pub dt: f32,
    pub friction: f32,
    pub max_force: f32,
    pub bound: f32,
}

impl Default for RollingSphereEnv {
    fn default() -> Self {
        Self {
            position: 0.0,
            velocity: 0.0,
            dt: 0.05,
            friction: 0.5,
            max_force: 1.0,
            bound: 2.0,
        }
    }
}

impl RollingSphereEnv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn observation(&self) -> Vec<f32> {
        vec![self.position, self.velocity]
    }
}

impl Env for RollingSphereEnv {
    fn step(&mut self, action: f32) -> (Vec<f32>, f32, bool) {
        let force = action.clamp(-self.max_force, self.max_force);
        let previous = self.position;
        // semi-implicit Euler with linear rolling friction
        self.velocity += (force - self.friction * self.velocity) * self.dt;
        self.position += self.velocity * self.dt;
        let done = self.position.abs() > self.bound;
        (self.observation(), self.position - previous, done)
    }

    fn reset(&mut self) -> Vec<f32> {
        self.position = 0.0;
        self.velocity = 0.0;
        self.observation()
    }

    fn obs_size(&self) -> usize {
        2
    }

    fn action_size(&self) -> usize {
        1
    }
}

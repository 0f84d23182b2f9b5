// Planar arm reference environment
//
// A kinematic 5-link arm anchored at the origin, reaching into a square
// scene with at most one object. Contacts push the object away from the
// touching link endpoint; no dynamics beyond that.

use anyhow::{bail, Context, Result};
use ndarray::{Array1, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::fs;
use std::path::PathBuf;

use super::{Agent, Environment, EnvironmentFactory, RenderOptions, SensorState, EMPTY_CONTEXT};
use crate::config::Config;

pub const LINKS: usize = 5;
const LINK_LENGTH: f64 = 1.0;
const JOINT_GAIN: f64 = 0.25;
const CONTACT_RADIUS: f64 = 0.6;
const VIEW_HALF_WIDTH: f64 = 6.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArmState {
    rng: ChaCha20Rng,
    joints: [f64; LINKS],
    object: Option<[f64; 2]>,
    /// Fraction of penetration converted into object displacement
    mobility: f64,
    context: u8,
    render_to: Option<PathBuf>,
    /// Fingertip and object positions per step while rendering
    trail: Vec<[f64; 4]>,
}

#[derive(Debug, Clone)]
pub struct PlanarArmEnv {
    side: usize,
    touch_size: usize,
    state: ArmState,
}

impl PlanarArmEnv {
    pub fn new(seed: u64, side: usize, touch_size: usize) -> Self {
        Self {
            side,
            touch_size,
            state: ArmState {
                rng: ChaCha20Rng::seed_from_u64(seed),
                joints: [0.0; LINKS],
                object: None,
                mobility: 0.0,
                context: EMPTY_CONTEXT,
                render_to: None,
                trail: Vec::new(),
            },
        }
    }

    /// Link endpoints from the base outwards; the last one is the fingertip
    fn endpoints(&self) -> [[f64; 2]; LINKS] {
        let mut points = [[0.0; 2]; LINKS];
        let mut angle = FRAC_PI_2;
        let mut pos = [0.0, 0.0];
        for (j, point) in points.iter_mut().enumerate() {
            angle += self.state.joints[j];
            pos = [pos[0] + LINK_LENGTH * angle.cos(), pos[1] + LINK_LENGTH * angle.sin()];
            *point = pos;
        }
        points
    }

    fn push_object(&mut self, endpoints: &[[f64; 2]; LINKS]) {
        let Some(mut obj) = self.state.object else {
            return;
        };
        if self.state.mobility <= 0.0 {
            return;
        }

        for p in endpoints {
            let d = [obj[0] - p[0], obj[1] - p[1]];
            let dist = (d[0] * d[0] + d[1] * d[1]).sqrt();
            if dist >= CONTACT_RADIUS {
                continue;
            }
            let dir = if dist > 1e-9 { [d[0] / dist, d[1] / dist] } else { [0.0, 1.0] };
            let shift = self.state.mobility * (CONTACT_RADIUS - dist);
            obj = [obj[0] + dir[0] * shift, obj[1] + dir[1] * shift];
        }
        self.state.object = Some(obj);
    }

    fn sensors(&self) -> SensorState {
        let endpoints = self.endpoints();
        let tip = endpoints[LINKS - 1];

        let side = self.side;
        let cell = 2.0 * VIEW_HALF_WIDTH / side as f64;
        let mut visual = Array1::zeros(side * side);
        for row in 0..side {
            let y = VIEW_HALF_WIDTH - (row as f64 + 0.5) * cell;
            for col in 0..side {
                let x = -VIEW_HALF_WIDTH + (col as f64 + 0.5) * cell;
                let mut v = 0.5 * blob([x, y], tip, 0.5);
                if let Some(obj) = self.state.object {
                    v += blob([x, y], obj, 0.8);
                }
                visual[row * side + col] = v.min(1.0);
            }
        }

        let mut touch = Array1::zeros(self.touch_size);
        if let Some(obj) = self.state.object {
            for (k, value) in touch.iter_mut().enumerate() {
                let p = endpoints[LINKS - 1 - (k % LINKS)];
                let dist = ((obj[0] - p[0]).powi(2) + (obj[1] - p[1]).powi(2)).sqrt();
                *value = (1.0 - dist / CONTACT_RADIUS).max(0.0);
            }
        }

        SensorState {
            visual,
            touch,
            joints: Array1::from_iter(self.state.joints.iter().copied()),
            object_position: self.state.object.unwrap_or([0.0, 0.0]),
        }
    }
}

fn blob(at: [f64; 2], center: [f64; 2], width: f64) -> f64 {
    let d2 = (at[0] - center[0]).powi(2) + (at[1] - center[1]).powi(2);
    (-d2 / (2.0 * width * width)).exp()
}

impl Environment for PlanarArmEnv {
    fn reset(&mut self, context: u8, render: Option<&RenderOptions>) -> Result<SensorState> {
        let rng = &mut self.state.rng;
        let mut joints = [0.0; LINKS];
        for joint in joints.iter_mut() {
            *joint = rng.gen_range(-0.1..0.1);
        }

        let (object, mobility) = match context {
            EMPTY_CONTEXT => (None, 0.0),
            1..=3 => {
                let angle = rng.gen_range(PI / 6.0..5.0 * PI / 6.0);
                let radius = rng.gen_range(2.5..4.0);
                let mobility = match context {
                    1 => 0.0,
                    2 => 1.0,
                    _ => 0.35,
                };
                (Some([radius * angle.cos(), radius * angle.sin()]), mobility)
            }
            other => bail!("Unknown scene context {}", other),
        };

        self.state.joints = joints;
        self.state.object = object;
        self.state.mobility = mobility;
        self.state.context = context;
        self.state.trail.clear();
        self.state.render_to = render.map(|r| r.output.clone());

        Ok(self.sensors())
    }

    fn step(&mut self, action: ArrayView1<'_, f64>) -> Result<SensorState> {
        for (j, joint) in self.state.joints.iter_mut().enumerate() {
            let target = action.get(j).copied().unwrap_or(0.0).clamp(-FRAC_PI_2, FRAC_PI_2);
            *joint += JOINT_GAIN * (target - *joint);
        }

        let endpoints = self.endpoints();
        self.push_object(&endpoints);

        if self.state.render_to.is_some() {
            let tip = endpoints[LINKS - 1];
            let obj = self.state.object.unwrap_or([0.0, 0.0]);
            self.state.trail.push([tip[0], tip[1], obj[0], obj[1]]);
        }

        Ok(self.sensors())
    }

    fn close(&mut self) {
        self.state.render_to = None;
        self.state.trail.clear();
    }

    fn render_info(&mut self, match_values: &[f64], match_flags: &[bool]) -> Result<()> {
        let Some(output) = &self.state.render_to else {
            return Ok(());
        };

        let path = output.with_extension("json");
        let payload = serde_json::json!({
            "context": self.state.context,
            "trail": self.state.trail,
            "match_values": match_values,
            "match_flags": match_flags,
        });
        fs::write(&path, serde_json::to_string(&payload)?)
            .with_context(|| format!("Failed to write episode render: {:?}", path))?;

        tracing::debug!(path = ?path, steps = self.state.trail.len(), "Rendered episode");
        Ok(())
    }

    fn save_state(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.state).context("Failed to serialize arm state")
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(state).context("Failed to parse arm state")?;
        Ok(())
    }
}

/// Builds planar arms with the configured sensor layout
#[derive(Debug, Clone)]
pub struct PlanarArmFactory {
    side: usize,
    touch_size: usize,
}

impl PlanarArmFactory {
    pub fn new(config: &Config) -> Result<Self> {
        let side = (config.visual_size as f64).sqrt().round() as usize;
        if side * side != config.visual_size {
            bail!(
                "visual_size {} is not a square number of sensors",
                config.visual_size
            );
        }
        if config.proprio_size > LINKS {
            bail!(
                "proprio_size {} exceeds the {} arm joints",
                config.proprio_size,
                LINKS
            );
        }
        Ok(Self {
            side,
            touch_size: config.touch_size,
        })
    }
}

impl EnvironmentFactory for PlanarArmFactory {
    type Env = PlanarArmEnv;

    fn create(&self, seed: u64) -> Result<PlanarArmEnv> {
        Ok(PlanarArmEnv::new(seed, self.side, self.touch_size))
    }
}

/// Reads the policy as consecutive joint-target segments, one per action
/// period, cycling when the policy runs out
#[derive(Debug, Clone)]
pub struct PlanarArmAgent {
    action_period: usize,
}

impl PlanarArmAgent {
    pub fn new(config: &Config) -> Self {
        Self {
            action_period: config.action_period.max(1),
        }
    }
}

impl Agent for PlanarArmAgent {
    fn act(&self, policy: ArrayView1<'_, f64>, _state: &SensorState, t: usize) -> Array1<f64> {
        let len = policy.len();
        if len == 0 {
            return Array1::zeros(LINKS);
        }
        let segments = (len / LINKS).max(1);
        let offset = ((t / self.action_period) % segments) * LINKS;
        Array1::from_shape_fn(LINKS, |j| policy[(offset + j) % len].tanh() * FRAC_PI_2)
    }
}

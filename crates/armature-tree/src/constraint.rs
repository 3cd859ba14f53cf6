//! Joint rotation constraints.
//!
//! A constraint is a pure function from a candidate local rotation to a
//! clamped one; evaluation never touches tree structure. Multiple
//! constraints on one node chain through an owned `next` link and are
//! evaluated head to tail.

use std::f32::consts::PI;
use std::fmt;
use std::rc::Rc;

use nalgebra::{Quaternion, Unit, UnitQuaternion, Vector3};

/// Host-supplied constraint callback.
///
/// Receives the candidate rotation and returns the replacement. The solver
/// treats it as a black box: nothing but the returned value feeds back into
/// the solve.
pub type ConstraintFn = Rc<dyn Fn(UnitQuaternion<f32>) -> UnitQuaternion<f32>>;

/// The closed set of constraint variants.
#[derive(Clone)]
pub enum ConstraintKind {
    /// Ignores the candidate entirely and holds a fixed rotation.
    Stiff { rotation: UnitQuaternion<f32> },

    /// Projects the candidate onto its twist about `axis` (swing is
    /// discarded) and clamps the signed angle to `[min_angle, max_angle]`.
    Hinge {
        axis: Unit<Vector3<f32>>,
        min_angle: f32,
        max_angle: f32,
    },

    /// Clamps the total angular deviation from a reference rotation to
    /// `[min_angle, max_angle]`, independent of deviation direction.
    Cone {
        rotation: UnitQuaternion<f32>,
        min_angle: f32,
        max_angle: f32,
    },

    /// Clamps the twist about the segment's own Z axis while preserving
    /// the swing component.
    Roll { min_angle: f32, max_angle: f32 },

    /// Host-supplied callback.
    Custom { apply: ConstraintFn },
}

impl fmt::Debug for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stiff { rotation } => f.debug_struct("Stiff").field("rotation", rotation).finish(),
            Self::Hinge {
                axis,
                min_angle,
                max_angle,
            } => f
                .debug_struct("Hinge")
                .field("axis", axis)
                .field("min_angle", min_angle)
                .field("max_angle", max_angle)
                .finish(),
            Self::Cone {
                rotation,
                min_angle,
                max_angle,
            } => f
                .debug_struct("Cone")
                .field("rotation", rotation)
                .field("min_angle", min_angle)
                .field("max_angle", max_angle)
                .finish(),
            Self::Roll {
                min_angle,
                max_angle,
            } => f
                .debug_struct("Roll")
                .field("min_angle", min_angle)
                .field("max_angle", max_angle)
                .finish(),
            Self::Custom { .. } => f.write_str("Custom"),
        }
    }
}

impl PartialEq for ConstraintKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Stiff { rotation: a }, Self::Stiff { rotation: b }) => a == b,
            (
                Self::Hinge {
                    axis: a0,
                    min_angle: a1,
                    max_angle: a2,
                },
                Self::Hinge {
                    axis: b0,
                    min_angle: b1,
                    max_angle: b2,
                },
            ) => a0 == b0 && a1 == b1 && a2 == b2,
            (
                Self::Cone {
                    rotation: a0,
                    min_angle: a1,
                    max_angle: a2,
                },
                Self::Cone {
                    rotation: b0,
                    min_angle: b1,
                    max_angle: b2,
                },
            ) => a0 == b0 && a1 == b1 && a2 == b2,
            (
                Self::Roll {
                    min_angle: a0,
                    max_angle: a1,
                },
                Self::Roll {
                    min_angle: b0,
                    max_angle: b1,
                },
            ) => a0 == b0 && a1 == b1,
            (Self::Custom { apply: a }, Self::Custom { apply: b }) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// A constraint plus the rest of its chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    kind: ConstraintKind,
    next: Option<Box<Constraint>>,
}

impl Constraint {
    pub fn stiff(rotation: UnitQuaternion<f32>) -> Self {
        Self::from_kind(ConstraintKind::Stiff { rotation })
    }

    /// Hinge about `axis` (normalized here) with a signed angle range.
    pub fn hinge(axis: Vector3<f32>, min_angle: f32, max_angle: f32) -> Self {
        Self::from_kind(ConstraintKind::Hinge {
            axis: Unit::new_normalize(axis),
            min_angle,
            max_angle,
        })
    }

    pub fn cone(rotation: UnitQuaternion<f32>, min_angle: f32, max_angle: f32) -> Self {
        Self::from_kind(ConstraintKind::Cone {
            rotation,
            min_angle,
            max_angle,
        })
    }

    pub fn roll(min_angle: f32, max_angle: f32) -> Self {
        Self::from_kind(ConstraintKind::Roll {
            min_angle,
            max_angle,
        })
    }

    pub fn custom(apply: impl Fn(UnitQuaternion<f32>) -> UnitQuaternion<f32> + 'static) -> Self {
        Self::from_kind(ConstraintKind::Custom {
            apply: Rc::new(apply),
        })
    }

    const fn from_kind(kind: ConstraintKind) -> Self {
        Self { kind, next: None }
    }

    pub const fn kind(&self) -> &ConstraintKind {
        &self.kind
    }

    pub fn next(&self) -> Option<&Constraint> {
        self.next.as_deref()
    }

    /// Append a constraint at the tail of this chain.
    pub fn append(&mut self, constraint: Constraint) {
        match &mut self.next {
            Some(next) => next.append(constraint),
            None => self.next = Some(Box::new(constraint)),
        }
    }

    /// Number of constraints in this chain, including `self`.
    pub fn chain_len(&self) -> usize {
        1 + self.next.as_ref().map_or(0, |next| next.chain_len())
    }

    /// Copy of this constraint alone, with no chain tail.
    pub fn duplicate(&self) -> Self {
        Self::from_kind(self.kind.clone())
    }

    /// Copy of this constraint and its entire chain.
    pub fn duplicate_chain(&self) -> Self {
        self.clone()
    }

    /// Evaluate the whole chain, head to tail.
    pub fn apply(&self, rotation: UnitQuaternion<f32>) -> UnitQuaternion<f32> {
        let clamped = self.apply_one(rotation);
        match &self.next {
            Some(next) => next.apply(clamped),
            None => clamped,
        }
    }

    fn apply_one(&self, rotation: UnitQuaternion<f32>) -> UnitQuaternion<f32> {
        match &self.kind {
            ConstraintKind::Stiff { rotation: fixed } => *fixed,
            ConstraintKind::Hinge {
                axis,
                min_angle,
                max_angle,
            } => {
                let (_, twist) = swing_twist(&rotation, axis);
                let angle = twist_angle(&twist, axis).clamp(*min_angle, *max_angle);
                UnitQuaternion::from_axis_angle(axis, angle)
            }
            ConstraintKind::Cone {
                rotation: reference,
                min_angle,
                max_angle,
            } => {
                let deviation = reference.inverse() * rotation;
                let angle = deviation.angle();
                let clamped = angle.clamp(*min_angle, *max_angle);
                if (clamped - angle).abs() <= f32::EPSILON {
                    return rotation;
                }
                let axis = deviation.axis().unwrap_or_else(Vector3::x_axis);
                reference * UnitQuaternion::from_axis_angle(&axis, clamped)
            }
            ConstraintKind::Roll {
                min_angle,
                max_angle,
            } => {
                let axis = Vector3::z_axis();
                let (swing, twist) = swing_twist(&rotation, &axis);
                let angle = twist_angle(&twist, &axis).clamp(*min_angle, *max_angle);
                swing * UnitQuaternion::from_axis_angle(&axis, angle)
            }
            ConstraintKind::Custom { apply } => apply(rotation),
        }
    }
}

/// Decompose `rotation` into (swing, twist) about `axis`, with
/// `rotation == swing * twist`.
///
/// A rotation of exactly 180 degrees perpendicular to the axis has no twist
/// component; the twist degenerates to identity rather than NaN.
pub fn swing_twist(
    rotation: &UnitQuaternion<f32>,
    axis: &Unit<Vector3<f32>>,
) -> (UnitQuaternion<f32>, UnitQuaternion<f32>) {
    let projection = rotation.imag().dot(axis);
    let twist_raw = Quaternion::from_parts(rotation.scalar(), axis.into_inner() * projection);
    if twist_raw.norm_squared() <= f32::EPSILON {
        (*rotation, UnitQuaternion::identity())
    } else {
        let twist = UnitQuaternion::new_normalize(twist_raw);
        let swing = rotation * twist.inverse();
        (swing, twist)
    }
}

/// Signed angle of a twist quaternion about `axis`, wrapped to `(-pi, pi]`.
fn twist_angle(twist: &UnitQuaternion<f32>, axis: &Unit<Vector3<f32>>) -> f32 {
    let sin_half = twist.imag().dot(axis);
    let angle = 2.0 * sin_half.atan2(twist.scalar());
    if angle > PI {
        angle - 2.0 * PI
    } else if angle < -PI {
        angle + 2.0 * PI
    } else {
        angle
    }
}

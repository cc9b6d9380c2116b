// Fitness profile: the user-selected attributes that steer the coach's system prompt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoachError;
use crate::history::WorkoutRecord;

/// Declares a fixed option set. Each variant serializes as its display label,
/// so the web form, the WebSocket payloads and the prompt all share one spelling.
macro_rules! option_set {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $label)] $variant),+
        }

        impl $name {
            /// Every option, in the order the form presents them.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }

        impl FromStr for $name {
            type Err = CoachError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL
                    .iter()
                    .copied()
                    .find(|option| option.label().eq_ignore_ascii_case(s.trim()))
                    .ok_or_else(|| CoachError::InvalidSelection(s.to_string()))
            }
        }
    };
}

option_set! {
    /// Single-select current fitness level.
    FitnessLevel {
        Beginner => "Beginner",
        Intermediate => "Intermediate",
        Advanced => "Advanced",
    }
}

option_set! {
    Goal {
        WeightLoss => "Weight Loss",
        MuscleGain => "Muscle Gain",
        Endurance => "Endurance",
        Flexibility => "Flexibility",
        Strength => "Strength",
        GeneralFitness => "General Fitness",
    }
}

option_set! {
    /// Injuries or limitations the coach must work around.
    Injury {
        None => "None",
        BackPain => "Back Pain",
        KneeIssues => "Knee Issues",
        ShoulderProblems => "Shoulder Problems",
        AnkleIssues => "Ankle Issues",
        Other => "Other",
    }
}

option_set! {
    Preference {
        Cardio => "Cardio",
        StrengthTraining => "Strength Training",
        Yoga => "Yoga",
        Hiit => "HIIT",
        Sports => "Sports",
        OutdoorActivities => "Outdoor Activities",
    }
}

impl Default for FitnessLevel {
    // The level select has no empty state; its first option is preselected.
    fn default() -> Self {
        FitnessLevel::Beginner
    }
}

/// One edit coming from the profile form. Applying it replaces the whole field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum ProfileUpdate {
    FitnessLevel(FitnessLevel),
    Goals(Vec<Goal>),
    Injuries(Vec<Injury>),
    Preferences(Vec<Preference>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FitnessProfile {
    pub fitness_level: FitnessLevel,
    pub goals: Vec<Goal>,
    pub injuries: Vec<Injury>,
    pub preferences: Vec<Preference>,
    pub workout_history: Vec<WorkoutRecord>,
}

impl FitnessProfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites the field named by `update`. Repeated picks collapse to their first occurrence.
    pub fn apply(&mut self, update: ProfileUpdate) {
        match update {
            ProfileUpdate::FitnessLevel(level) => self.fitness_level = level,
            ProfileUpdate::Goals(goals) => self.goals = dedup_in_order(goals),
            ProfileUpdate::Injuries(injuries) => self.injuries = dedup_in_order(injuries),
            ProfileUpdate::Preferences(preferences) => {
                self.preferences = dedup_in_order(preferences)
            }
        }
    }

    pub fn record_workout(&mut self, record: WorkoutRecord) {
        self.workout_history.push(record);
    }
}

fn dedup_in_order<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut unique = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

/// Joins labels the way the prompt and the terminal banner display a selection.
pub fn join_labels<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

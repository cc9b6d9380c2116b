use crate::conversation::Message;
use crate::profile::{join_labels, FitnessProfile};

/// Builds the system message that steers every completion request.
///
/// Pure: the same profile always yields the same content. Workout history is
/// not part of the prompt.
pub fn compose_system_message(profile: &FitnessProfile) -> Message {
    let content = format!(
        "You are an expert fitness coach. The user's profile is:\n\
         - Fitness Level: {}\n\
         - Goals: {}\n\
         - Injuries/Limitations: {}\n\
         - Preferences: {}\n\
         \n\
         Provide detailed, personalized fitness advice. Include:\n\
         1. Specific exercise recommendations\n\
         2. Form guidance\n\
         3. Modifications for any injuries\n\
         4. Progress tracking suggestions\n\
         5. Motivation and encouragement\n\
         \n\
         Always consider safety first and provide modifications when needed.",
        profile.fitness_level,
        join_labels(&profile.goals),
        join_labels(&profile.injuries),
        join_labels(&profile.preferences),
    );

    Message::system(content)
}

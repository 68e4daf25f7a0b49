pub mod heuristics;
pub mod leaderboard;
pub mod membership;
pub mod review;
pub mod scheduler;

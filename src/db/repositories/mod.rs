mod checkpoints;
mod history;
mod series;

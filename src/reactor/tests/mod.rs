mod tests_backend;
mod tests_timers;

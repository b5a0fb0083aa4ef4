mod build;
mod fetch;

mod config;
mod exporters;
mod layer;

// expose the engine + mode files in src/mods/
pub mod index;
pub mod scorer;
pub mod regions;
pub mod window;
pub mod stability;
pub mod pipeline;
pub mod session;
pub mod replay;
pub mod lookup;
pub mod inspect;

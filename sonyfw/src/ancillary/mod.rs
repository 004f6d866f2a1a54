//! Readers for the smaller, single-purpose formats that sit alongside the
//! main `.dat`/`FDAT` pipeline: partition tables (SDM, MBR), bootloader
//! partitions, warm-boot images, and the ASH/DSLR-era firmware containers
//! used before Sony standardised on `.dat`.

pub mod ash;
pub mod bootloader;
pub mod dslr;
pub mod mbr;
pub mod sdm;
pub mod wbi;

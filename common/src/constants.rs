pub const BYTE: u16 = 1; // Bytes
pub const WORD: u16 = 2; // Bytes

// Section name given to symbols that have no owning section yet.
pub const UNDEFINED: &str = "UNDEFINED";

// Column width of the listing tables.
pub const WIDTH: usize = 20;

// Number of flag positions in a section flag string (WAXMSILGTE).
pub const NUM_FLAGS: usize = 10;

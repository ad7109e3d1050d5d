pub const NAMESPACE: &str = "spBv1.0";

pub const BDSEQ: &str = "bdSeq";

pub const NODE_CONTROL_REBIRTH: &str = "Node Control/Rebirth";
pub const NODE_CONTROL_REBOOT: &str = "Node Control/Reboot";
pub const NODE_CONTROL_NEXT_SERVER: &str = "Node Control/Next Server";
pub const NODE_CONTROL_SCAN_RATE: &str = "Node Control/Scan Rate";

pub const NBIRTH: &str = "NBIRTH";
pub const NDEATH: &str = "NDEATH";
pub const NDATA: &str = "NDATA";
pub const NCMD: &str = "NCMD";

pub const DBIRTH: &str = "DBIRTH";
pub const DDEATH: &str = "DDEATH";
pub const DDATA: &str = "DDATA";
pub const DCMD: &str = "DCMD";

pub const STATE: &str = "STATE";

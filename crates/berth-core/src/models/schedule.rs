use std::time::SystemTime;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Schedule {
    pub id: i64,
    pub vendor_type: String,
    pub vendor_id: i64,
    pub cron: String,
    pub callback_func_name: String,
    pub callback_func_param: String,
    pub creation_time: SystemTime,
    pub update_time: SystemTime,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NewSchedule {
    pub vendor_type: String,
    pub vendor_id: i64,
    pub cron: String,
    pub callback_func_name: String,
    pub callback_func_param: String,
}
